//! Pipe-delimited wire prefix carrying dedup identity.
//!
//! Publishers prefix bodies as `id|f1|f2|...|body`. Subscribers check the
//! field count their transport expects; on a match the id is extracted and,
//! for most transports, stripped before delivery. Anything else is delivered
//! untouched without an id.

const SEPARATOR: u8 = b'|';

/// Fields in a nanomsg subscriber body.
pub const NANO_FIELDS: usize = 5;
/// Fields in an AMQP event body.
pub const AMQP_FIELDS: usize = 6;
/// Fields in NATS, streaming, PubNub and Redis bodies.
pub const STANDARD_FIELDS: usize = 7;

/// Index of the timestamp field in an AMQP event body.
const AMQP_TIMESTAMP_FIELD: usize = 3;

fn field_count(body: &[u8]) -> usize {
    body.iter().filter(|b| **b == SEPARATOR).count() + 1
}

/// Split off a leading id when `body` has exactly `fields` fields.
///
/// Returns the id and the body without `id|`.
pub fn strip_leading_id(body: &[u8], fields: usize) -> Option<(String, Vec<u8>)> {
    if field_count(body) != fields {
        return None;
    }
    let split = body.iter().position(|b| *b == SEPARATOR)?;
    let id = String::from_utf8_lossy(&body[..split]).into_owned();
    Some((id, body[split + 1..].to_vec()))
}

/// AMQP identity: the last field is the event id, field 3 its timestamp.
///
/// The body is left untouched. An unparseable timestamp reads as zero.
pub fn trailing_event(body: &[u8], fields: usize) -> Option<(String, i64)> {
    if field_count(body) != fields {
        return None;
    }
    let parts: Vec<&[u8]> = body.split(|b| *b == SEPARATOR).collect();
    let id = String::from_utf8_lossy(parts.last()?).into_owned();
    let timestamp = parts
        .get(AMQP_TIMESTAMP_FIELD)
        .and_then(|field| std::str::from_utf8(field).ok())
        .and_then(|field| field.trim().parse().ok())
        .unwrap_or(0);
    Some((id, timestamp))
}

/// Split the `ts|` prefix the Redis publish script adds.
///
/// Returns `None` when the payload carries no numeric prefix.
pub fn split_watermark(payload: &str) -> Option<(i64, &str)> {
    let (head, rest) = payload.split_once(SEPARATOR as char)?;
    let watermark = head.parse().ok()?;
    Some((watermark, rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_leading_id() {
        let (id, body) = strip_leading_id(b"u-1|a|b|c|payload", NANO_FIELDS).unwrap();
        assert_eq!(id, "u-1");
        assert_eq!(body, b"a|b|c|payload");
    }

    #[test]
    fn test_strip_leading_id_wrong_count() {
        assert!(strip_leading_id(b"u-1|a|payload", NANO_FIELDS).is_none());
        assert!(strip_leading_id(b"payload", STANDARD_FIELDS).is_none());
        assert!(strip_leading_id(b"", NANO_FIELDS).is_none());
    }

    #[test]
    fn test_strip_leading_id_standard() {
        let (id, body) = strip_leading_id(b"id|1|2|3|4|5|body", STANDARD_FIELDS).unwrap();
        assert_eq!(id, "id");
        assert_eq!(body, b"1|2|3|4|5|body");
    }

    #[test]
    fn test_trailing_event() {
        let (id, ts) = trailing_event(b"a|b|c|1700000000|e|evt-9", AMQP_FIELDS).unwrap();
        assert_eq!(id, "evt-9");
        assert_eq!(ts, 1_700_000_000);
    }

    #[test]
    fn test_trailing_event_bad_timestamp_reads_zero() {
        let (id, ts) = trailing_event(b"a|b|c|soon|e|evt-9", AMQP_FIELDS).unwrap();
        assert_eq!(id, "evt-9");
        assert_eq!(ts, 0);
        assert!(trailing_event(b"a|b|evt", AMQP_FIELDS).is_none());
    }

    #[test]
    fn test_split_watermark() {
        assert_eq!(split_watermark("1700|id|x"), Some((1700, "id|x")));
        assert_eq!(split_watermark("1700|"), Some((1700, "")));
        assert_eq!(split_watermark("plain"), None);
        assert_eq!(split_watermark("abc|x"), None);
    }
}
