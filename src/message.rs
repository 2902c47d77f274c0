//! Envelope codec for everything that crosses a stage boundary.
//!
//! A message is text of the form `<TTT>[<payload>]`:
//!
//! - `TTT` is the 3-character [`Kind`] code.
//! - The bracketed part is a JSON array. Its first element is always the session
//!   id. For a data batch the remaining elements are row objects
//!   (`{"field":"value",...}`); for an `EOF` message the single remaining
//!   element is the code of the kind the EOF terminates.
//!
//! ```text
//! TRN["s-1",{"transaction_id":"7","final_amount":"80.0"},{"transaction_id":"8","final_amount":"12.5"}]
//! EOF["s-1","TRN"]
//! ```
//!
//! Session identity travels only inside the envelope, never in the address, so
//! every stage reads it the same way.
//!
//! All functions here are pure. Decoders return [`StageError::Format`] for
//! anything that does not parse, including a declared kind the caller did not
//! expect.

use crate::error::{Result, StageError};
use crate::row::Row;
use serde::ser::{Serialize, SerializeSeq, Serializer};
use serde_json::Value;
use std::fmt;
use tracing::error;

/// `TTT[]`
pub const MIN_ENVELOPE_LEN: usize = 5;

/// Closed set of batch kinds plus the end-of-stream sentinel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Kind {
    Transactions,
    TransactionItems,
    Stores,
    Users,
    MenuItems,
    /// Large transactions in the morning-to-night window.
    Q1,
    /// Best-selling item per month by quantity.
    Q2Quantity,
    /// Best-selling item per month by revenue.
    Q2Profit,
    /// Total payment value per store and semester.
    Q3,
    /// Most frequent customers per store.
    Q4,
    Eof,
}

impl Kind {
    /// The five datasets a client uploads.
    pub const DATASETS: [Self; 5] = [
        Self::Transactions,
        Self::TransactionItems,
        Self::Stores,
        Self::Users,
        Self::MenuItems,
    ];

    /// The five query results streamed back to a client.
    pub const RESULTS: [Self; 5] = [
        Self::Q1,
        Self::Q2Quantity,
        Self::Q2Profit,
        Self::Q3,
        Self::Q4,
    ];

    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Transactions => "TRN",
            Self::TransactionItems => "TIT",
            Self::Stores => "STR",
            Self::Users => "USR",
            Self::MenuItems => "MNU",
            Self::Q1 => "Q1R",
            Self::Q2Quantity => "Q2Q",
            Self::Q2Profit => "Q2P",
            Self::Q3 => "Q3R",
            Self::Q4 => "Q4R",
            Self::Eof => "EOF",
        }
    }

    /// # Errors
    /// [`StageError::Format`] for an unknown code.
    pub fn from_code(code: &str) -> Result<Self> {
        Ok(match code {
            "TRN" => Self::Transactions,
            "TIT" => Self::TransactionItems,
            "STR" => Self::Stores,
            "USR" => Self::Users,
            "MNU" => Self::MenuItems,
            "Q1R" => Self::Q1,
            "Q2Q" => Self::Q2Quantity,
            "Q2P" => Self::Q2Profit,
            "Q3R" => Self::Q3,
            "Q4R" => Self::Q4,
            "EOF" => Self::Eof,
            other => return Err(StageError::format(format!("unknown kind code `{other}`"))),
        })
    }

    /// Every kind except the sentinel carries rows.
    #[must_use]
    pub const fn is_data(self) -> bool {
        !matches!(self, Self::Eof)
    }

    #[must_use]
    pub const fn is_result(self) -> bool {
        matches!(
            self,
            Self::Q1 | Self::Q2Quantity | Self::Q2Profit | Self::Q3 | Self::Q4
        )
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// An encoded envelope. Opaque to everything but this module.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Message(String);

impl Message {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for Message {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Message {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A fully decoded message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Batch {
        kind: Kind,
        session: String,
        rows: Vec<Row>,
    },
    Eof {
        session: String,
        kind: Kind,
    },
}

impl Frame {
    #[must_use]
    pub fn session(&self) -> &str {
        match self {
            Self::Batch { session, .. } | Self::Eof { session, .. } => session,
        }
    }
}

/* ===================== encode ===================== */

/// JSON array payload of a data batch: the session id, then one object per row.
struct BatchPayload<'a> {
    session: &'a str,
    rows: &'a [Row],
}

impl Serialize for BatchPayload<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(1 + self.rows.len()))?;
        seq.serialize_element(self.session)?;
        for row in self.rows {
            seq.serialize_element(row)?;
        }
        seq.end()
    }
}

/// Encode a batch of `kind` rows for `session`.
///
/// `kind` must be a data kind; use [`encode_eof`] for the sentinel.
#[must_use]
pub fn encode_rows(kind: Kind, session: &str, rows: &[Row]) -> Message {
    debug_assert!(kind.is_data(), "encode_rows called with EOF");
    envelope(kind, &BatchPayload { session, rows }, session.len() + rows.len() * 64)
}

/// Encode the end-of-stream marker for `kind` in `session`.
#[must_use]
pub fn encode_eof(session: &str, kind: Kind) -> Message {
    debug_assert!(kind.is_data(), "EOF cannot terminate EOF");
    envelope(Kind::Eof, &(session, kind.code()), session.len() + 8)
}

fn envelope<T: Serialize>(kind: Kind, payload: &T, hint: usize) -> Message {
    let mut out = Vec::with_capacity(MIN_ENVELOPE_LEN + hint);
    out.extend_from_slice(kind.code().as_bytes());
    // strings and string maps into a Vec<u8> have no failure path
    if let Err(e) = serde_json::to_writer(&mut out, payload) {
        error!(kind = %kind, error = %e, "payload serialization failed");
    }
    Message(String::from_utf8(out).unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned()))
}

/* ===================== decode ===================== */

/// Declared kind of `msg`.
///
/// # Errors
/// [`StageError::Format`] if `msg` is shorter than [`MIN_ENVELOPE_LEN`] or the
/// code is unknown.
pub fn decode_type(msg: &Message) -> Result<Kind> {
    let (code, _) = split_envelope(msg)?;
    Kind::from_code(code)
}

/// Session id carried by `msg`.
///
/// # Errors
/// [`StageError::Format`] if the envelope does not parse.
pub fn decode_session_id(msg: &Message) -> Result<String> {
    let (_, body) = split_envelope(msg)?;
    let (session, _) = parse_body(body)?;
    Ok(session)
}

/// Rows of a data batch whose declared kind must equal `expected`.
///
/// # Errors
/// [`StageError::Format`] on a kind mismatch (including EOF), a truncated
/// envelope, or a payload element that is not a string-valued object.
pub fn decode_rows(msg: &Message, expected: Kind) -> Result<Vec<Row>> {
    let (code, body) = split_envelope(msg)?;
    let kind = Kind::from_code(code)?;
    if kind != expected {
        return Err(StageError::format(format!(
            "expected a {expected} batch, got {kind}"
        )));
    }
    let (_, rest) = parse_body(body)?;
    rows_from_values(rest)
}

/// Kind terminated by an EOF message.
///
/// # Errors
/// [`StageError::Format`] if `msg` is not a well-formed EOF envelope.
pub fn decode_eof(msg: &Message) -> Result<Kind> {
    let (code, body) = split_envelope(msg)?;
    if Kind::from_code(code)? != Kind::Eof {
        return Err(StageError::format(format!("expected EOF, got {code}")));
    }
    let (_, rest) = parse_body(body)?;
    eof_kind_from_values(rest)
}

/// Decode `msg` in one pass.
///
/// # Errors
/// [`StageError::Format`] as for the individual decoders.
pub fn decode(msg: &Message) -> Result<Frame> {
    let (code, body) = split_envelope(msg)?;
    let kind = Kind::from_code(code)?;
    let (session, rest) = parse_body(body)?;
    if kind == Kind::Eof {
        Ok(Frame::Eof {
            session,
            kind: eof_kind_from_values(rest)?,
        })
    } else {
        Ok(Frame::Batch {
            kind,
            session,
            rows: rows_from_values(rest)?,
        })
    }
}

fn split_envelope(msg: &Message) -> Result<(&str, &str)> {
    let s = msg.as_str();
    if s.len() < MIN_ENVELOPE_LEN {
        return Err(StageError::format(format!(
            "message of {} bytes is shorter than the {MIN_ENVELOPE_LEN}-byte envelope",
            s.len()
        )));
    }
    let (code, body) = s
        .split_at_checked(3)
        .ok_or_else(|| StageError::format("kind code is not 3 ASCII characters"))?;
    if !body.starts_with('[') || !body.ends_with(']') {
        return Err(StageError::format("payload is not enclosed in brackets"));
    }
    Ok((code, body))
}

fn parse_body(body: &str) -> Result<(String, Vec<Value>)> {
    let items: Vec<Value> =
        serde_json::from_str(body).map_err(|e| StageError::format(format!("payload: {e}")))?;
    let mut items = items.into_iter();
    match items.next() {
        Some(Value::String(session)) => Ok((session, items.collect())),
        Some(_) => Err(StageError::format("session id is not a string")),
        None => Err(StageError::format("payload has no session id")),
    }
}

fn rows_from_values(values: Vec<Value>) -> Result<Vec<Row>> {
    values
        .into_iter()
        .enumerate()
        .map(|(i, v)| {
            serde_json::from_value::<Row>(v)
                .map_err(|e| StageError::format(format!("row #{}: {e}", i + 1)))
        })
        .collect()
}

fn eof_kind_from_values(values: Vec<Value>) -> Result<Kind> {
    match values.as_slice() {
        [Value::String(code)] => {
            let kind = Kind::from_code(code)?;
            if kind.is_data() {
                Ok(kind)
            } else {
                Err(StageError::format("EOF cannot terminate EOF"))
            }
        }
        _ => Err(StageError::format(
            "EOF payload must be exactly one kind code",
        )),
    }
}
