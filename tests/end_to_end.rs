use std::sync::Arc;
use std::time::Duration;

use signal_relay::{ServerConfig, SignalServer};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};

const WAIT: Duration = Duration::from_secs(3);

fn test_config() -> ServerConfig {
    ServerConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        heartbeat_interval: Duration::from_secs(30),
        heartbeat_timeout: Duration::from_secs(60),
        sync_interval: Duration::from_millis(300),
        ..Default::default()
    }
}

async fn started(config: ServerConfig) -> SignalServer {
    let server = SignalServer::bind(config).await.expect("bind");
    server.start().expect("start");
    server
}

async fn wait_for_connections(server: &SignalServer, want: usize) {
    let deadline = Instant::now() + WAIT;
    while server.connection_count() != want {
        assert!(
            Instant::now() < deadline,
            "expected {want} connections, have {}",
            server.connection_count()
        );
        sleep(Duration::from_millis(10)).await;
    }
}

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(server: &SignalServer) -> Self {
        let stream = TcpStream::connect(server.local_addr()).await.expect("connect");
        let (r, w) = stream.into_split();
        Self { reader: BufReader::new(r), writer: w }
    }

    /// Read lines until one equals `want`, skipping anything else.
    async fn expect_line(&mut self, want: &str) {
        let deadline = Instant::now() + WAIT;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            let mut line = String::new();
            let n = timeout(left, self.reader.read_line(&mut line))
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {want:?}"))
                .expect("read");
            assert!(n > 0, "connection closed while waiting for {want:?}");
            if line.trim_end() == want {
                return;
            }
        }
    }

    async fn send(&mut self, text: &str) {
        self.writer.write_all(text.as_bytes()).await.expect("write");
    }
}

#[tokio::test]
async fn directive_is_relayed_then_synced_to_every_client() {
    let server = started(test_config()).await;
    let mut a = Client::connect(&server).await;
    let mut b = Client::connect(&server).await;
    wait_for_connections(&server, 2).await;

    assert_eq!(server.submit_signal("LONG|MES|2").await.unwrap(), 2.0);

    for c in [&mut a, &mut b] {
        c.expect_line("LONG|MES|2").await;
        c.expect_line("SYNC_TARGET|MES|2").await;
    }
    server.stop().await;
}

/// Follow `MES` through relayed `LONG|MES|1` lines and `SYNC_TARGET|MES|n`
/// snapshots. Every snapshot must equal the running net implied by what the
/// client has seen so far; returns once a snapshot reports `final_net`.
async fn follow_consistently(mut client: Client, final_net: f64) {
    let deadline = Instant::now() + Duration::from_secs(20);
    let mut running: Option<f64> = None;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        let mut line = String::new();
        let n = timeout(left, client.reader.read_line(&mut line))
            .await
            .unwrap_or_else(|_| panic!("never saw SYNC_TARGET|MES|{final_net}, at {running:?}"))
            .expect("read");
        assert!(n > 0, "connection closed at {running:?}");
        let line = line.trim_end();
        if line == "LONG|MES|1" {
            // before the first snapshot the baseline is unknown
            running = running.map(|v| v + 1.0);
        } else if let Some(net) = line.strip_prefix("SYNC_TARGET|MES|") {
            let net: f64 = net.parse().expect("numeric net");
            if let Some(expected) = running {
                assert_eq!(net, expected, "snapshot lags behind relayed directives");
            }
            running = Some(net);
            if net == final_net {
                return;
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sync_snapshots_never_lag_behind_relayed_directives() {
    const TOTAL: usize = 300;
    let server = Arc::new(
        started(ServerConfig { sync_interval: Duration::from_millis(1), ..test_config() }).await,
    );
    let early = Client::connect(&server).await;
    wait_for_connections(&server, 1).await;
    server.submit_signal("LONG|MES|1").await.unwrap();

    let producer = {
        let server = server.clone();
        tokio::spawn(async move {
            for _ in 1..TOTAL {
                server.submit_signal("LONG|MES|1").await.unwrap();
                tokio::task::yield_now().await;
            }
        })
    };
    let early = tokio::spawn(follow_consistently(early, TOTAL as f64));

    // joiners admitted mid-stream get a welcome snapshot racing the relay
    let mut late = Vec::new();
    for _ in 0..3 {
        sleep(Duration::from_millis(5)).await;
        let client = Client::connect(&server).await;
        late.push(tokio::spawn(follow_consistently(client, TOTAL as f64)));
    }

    producer.await.unwrap();
    early.await.unwrap();
    for joiner in late {
        joiner.await.unwrap();
    }
    assert_eq!(server.target("MES"), TOTAL as f64);
    server.stop().await;
}

#[tokio::test]
async fn late_joiner_receives_current_targets_on_connect() {
    let server = started(ServerConfig { sync_interval: Duration::from_secs(30), ..test_config() }).await;
    server.submit_signal("SHORT|ES|3").await.unwrap();
    server.submit_signal("CLOSE|ES|1").await.unwrap();

    let mut late = Client::connect(&server).await;
    late.expect_line("SYNC_TARGET|ES|-2").await;
    server.stop().await;
}

#[tokio::test]
async fn silent_client_is_evicted_without_disturbing_others() {
    let server = started(ServerConfig {
        heartbeat_interval: Duration::from_millis(100),
        heartbeat_timeout: Duration::from_millis(300),
        ..test_config()
    })
    .await;

    // never reads or writes: looks like a half-dead peer
    let _silent = TcpStream::connect(server.local_addr()).await.unwrap();

    // answers every heartbeat and forwards the rest
    let responsive = TcpStream::connect(server.local_addr()).await.unwrap();
    let (r, mut w) = responsive.into_split();
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        let mut lines = BufReader::new(r).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(token) = line.strip_prefix("HEARTBEAT|") {
                if w.write_all(format!("ACK|{token}\n").as_bytes()).await.is_err() {
                    break;
                }
            } else if seen_tx.send(line).is_err() {
                break;
            }
        }
    });

    wait_for_connections(&server, 2).await;
    wait_for_connections(&server, 1).await;

    server.submit_signal("LONG|MES|1").await.unwrap();
    let got = timeout(WAIT, async {
        loop {
            match seen_rx.recv().await {
                Some(line) if line == "LONG|MES|1" => return line,
                Some(_) => continue,
                None => panic!("responsive client closed"),
            }
        }
    })
    .await
    .expect("responsive client never saw the directive");
    assert_eq!(got, "LONG|MES|1");
    assert_eq!(server.connection_count(), 1);
    server.stop().await;
}

#[tokio::test]
async fn connections_past_the_ceiling_are_refused() {
    let server = started(ServerConfig { max_connections: 2, ..test_config() }).await;
    let _a = Client::connect(&server).await;
    let _b = Client::connect(&server).await;
    wait_for_connections(&server, 2).await;

    let mut extra = TcpStream::connect(server.local_addr()).await.unwrap();
    let mut buf = [0u8; 16];
    let n = timeout(WAIT, extra.read(&mut buf)).await.expect("refused socket left open").unwrap_or(0);
    assert_eq!(n, 0);
    assert_eq!(server.connection_count(), 2);
    server.stop().await;
}

#[tokio::test]
async fn fills_from_clients_feed_the_position_tracker() {
    let mut config = test_config();
    config.instruments = signal_relay::config::parse_instruments("MES:0.25:1.25").unwrap();
    let server = started(config).await;
    let mut client = Client::connect(&server).await;
    wait_for_connections(&server, 1).await;

    // two messages in one write, then one split across writes
    client.send("FILL|MES|2|5000|A1\nFILL|MES|1|").await;
    sleep(Duration::from_millis(20)).await;
    client.send("5010|A1\nbogus line\nPRICE|MES|5006\n").await;

    let deadline = Instant::now() + WAIT;
    loop {
        let pos = server.tracker().position("A1", "MES");
        if pos.as_ref().map(|p| p.last_price) == Some(5006.0) {
            let p = pos.unwrap();
            assert_eq!(p.quantity, 3.0);
            assert!((p.avg_entry_price - 5003.333).abs() < 1e-2);
            // (5006 - 5003.33) * 3 * 5
            assert!((p.unrealized_pnl - 40.0).abs() < 1e-6);
            break;
        }
        assert!(Instant::now() < deadline, "fills never reached the tracker: {pos:?}");
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(server.tracker().profitable_account_count(), 1);
    assert_eq!(server.status().profitable_accounts, 1);
    server.stop().await;
}

#[tokio::test]
async fn fill_without_account_is_booked_to_its_connection() {
    let server = started(test_config()).await;
    let mut client = Client::connect(&server).await;
    wait_for_connections(&server, 1).await;
    client.send("FILL|mes|-1|5000\n").await;

    let deadline = Instant::now() + WAIT;
    while server.tracker().position("conn-1", "MES").is_none() {
        assert!(Instant::now() < deadline, "fill not booked");
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(server.tracker().position("conn-1", "MES").unwrap().quantity, -1.0);
    server.stop().await;
}

#[tokio::test]
async fn stop_closes_client_sockets() {
    let server = started(test_config()).await;
    let mut client = Client::connect(&server).await;
    wait_for_connections(&server, 1).await;
    server.stop().await;
    assert_eq!(server.connection_count(), 0);

    let mut line = String::new();
    let n = timeout(WAIT, client.reader.read_line(&mut line)).await.expect("socket left open").unwrap_or(0);
    assert_eq!(n, 0);
}
