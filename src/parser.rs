// ===============================
// src/parser.rs
// ===============================
//
// Line decoders for both directions of the wire protocol.
// Neither function can panic: every fault becomes an invalid signal or `None`,
// since both sit directly on network input.
//
use crate::domain::{Action, Inbound, Signal, ACK_TAG, FIELD_SEP, FILL_TAG, PRICE_TAG};

/// Decode `ACTION|SYMBOL|QUANTITY` into a [`Signal`].
pub fn parse_signal(raw: &str) -> Signal {
    let line = raw.trim();
    if line.is_empty() {
        return Signal::rejected(raw, Action::Unknown);
    }

    let fields: Vec<&str> = line.split(FIELD_SEP).map(str::trim).collect();
    if fields.len() != 3 {
        return Signal::rejected(line, Action::Unknown);
    }

    let action = Action::from_token(fields[0]);
    if action == Action::Unknown {
        return Signal::rejected(line, action);
    }

    let symbol = fields[1].to_ascii_uppercase();
    if symbol.is_empty() {
        return Signal::rejected(line, action);
    }

    let quantity = match parse_finite(fields[2]) {
        Some(q) if q >= 0.0 => q,
        _ => return Signal::rejected(line, action),
    };

    Signal { action, symbol, quantity, raw: line.to_string(), valid: true }
}

/// Decode a client -> server line (`ACK`, `FILL`, `PRICE`).
pub fn parse_inbound(line: &str) -> Option<Inbound> {
    let fields: Vec<&str> = line.trim().split(FIELD_SEP).map(str::trim).collect();
    let tag = fields.first()?.to_ascii_uppercase();

    match (tag.as_str(), fields.len()) {
        // any ACK counts as liveness, even with an unreadable token
        (ACK_TAG, 1 | 2) => Some(Inbound::Ack(fields.get(1).and_then(|t| t.parse().ok()))),
        (FILL_TAG, 4 | 5) => {
            let symbol = non_empty_symbol(fields[1])?;
            let quantity = parse_finite(fields[2]).filter(|q| *q != 0.0)?;
            let price = parse_finite(fields[3]).filter(|p| *p > 0.0)?;
            let account = fields.get(4).filter(|a| !a.is_empty()).map(|a| a.to_string());
            Some(Inbound::Fill { symbol, quantity, price, account })
        }
        (PRICE_TAG, 3) => {
            let symbol = non_empty_symbol(fields[1])?;
            let price = parse_finite(fields[2]).filter(|p| *p > 0.0)?;
            Some(Inbound::Mark { symbol, price })
        }
        _ => None,
    }
}

fn parse_finite(s: &str) -> Option<f64> {
    s.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn non_empty_symbol(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_ascii_uppercase())
}
