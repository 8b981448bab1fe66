// =============================================================================
// Kline Parsing — REST batch rows and live stream frames
// =============================================================================
//
// REST rows:      [openTime_ms, "open", "high", "low", "close", "volume", ...]
// Stream frames:  { "e": "kline", "s": "BTCUSDT", "k": { "t", "o", "h", "l",
//                   "c", "v", "x", ... } }
//
// Binance sends prices as JSON strings; numbers are accepted too.  Times are
// normalised from milliseconds to whole seconds.
// =============================================================================

use serde_json::Value;
use tracing::warn;

use crate::error::FeedError;
use crate::market_data::Candle;

/// Minimum number of fields a REST kline row must carry.
const MIN_ROW_FIELDS: usize = 6;

/// Convert a millisecond open time into whole seconds (floor).
pub fn ms_to_secs(ms: i64) -> i64 {
    ms.div_euclid(1000)
}

/// Binance sends numeric values as JSON strings inside kline objects.  Only
/// finite values are accepted; `"NaN"` and `"inf"` are malformed.
fn parse_f64(val: &Value, name: &str) -> Result<f64, FeedError> {
    match val {
        Value::String(s) => match s.parse::<f64>() {
            Ok(v) if v.is_finite() => Ok(v),
            Ok(_) => Err(FeedError::Malformed(format!("field {name} is not finite: {s}"))),
            Err(_) => Err(FeedError::Malformed(format!(
                "failed to parse {name} as f64: {s}"
            ))),
        },
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| FeedError::Malformed(format!("field {name} is not a valid f64"))),
        _ => Err(FeedError::Malformed(format!(
            "field {name} has unexpected JSON type"
        ))),
    }
}

fn parse_i64(val: &Value, name: &str) -> Result<i64, FeedError> {
    val.as_i64()
        .ok_or_else(|| FeedError::Malformed(format!("missing or non-integer field {name}")))
}

/// Parse the array-of-arrays body of `GET /api/v3/klines`.
///
/// Rows that are too short are skipped with a warning; a body that is not an
/// array, or a row with unparsable numbers, fails the whole batch so callers
/// never see a partial series.
pub fn parse_history_rows(body: &Value) -> Result<Vec<Candle>, FeedError> {
    let rows = body
        .as_array()
        .ok_or_else(|| FeedError::Malformed("klines response is not an array".into()))?;

    let mut candles = Vec::with_capacity(rows.len());
    for row in rows {
        let fields = row
            .as_array()
            .ok_or_else(|| FeedError::Malformed("kline entry is not an array".into()))?;

        if fields.len() < MIN_ROW_FIELDS {
            warn!(fields = fields.len(), "skipping malformed kline row");
            continue;
        }

        let open_time = parse_i64(&fields[0], "openTime")?;
        candles.push(Candle::new(
            ms_to_secs(open_time),
            parse_f64(&fields[1], "open")?,
            parse_f64(&fields[2], "high")?,
            parse_f64(&fields[3], "low")?,
            parse_f64(&fields[4], "close")?,
            parse_f64(&fields[5], "volume")?,
        ));
    }

    Ok(candles)
}

/// Parse one live stream frame.
///
/// Returns `Ok(None)` for frames without a `k` payload (subscription acks,
/// other event types), which are ignored rather than treated as errors.
/// Both the single-stream payload and the combined-stream `{stream, data}`
/// envelope are accepted.
pub fn parse_stream_frame(text: &str) -> Result<Option<Candle>, FeedError> {
    let root: Value = serde_json::from_str(text)?;

    let data = match root.get("data") {
        Some(inner) => inner,
        None => &root,
    };

    let k = match data.get("k") {
        Some(k) if !k.is_null() => k,
        _ => return Ok(None),
    };

    let open_time = parse_i64(&k["t"], "k.t")?;
    let candle = Candle {
        time: ms_to_secs(open_time),
        open: parse_f64(&k["o"], "k.o")?,
        high: parse_f64(&k["h"], "k.h")?,
        low: parse_f64(&k["l"], "k.l")?,
        close: parse_f64(&k["c"], "k.c")?,
        volume: parse_f64(&k["v"], "k.v")?,
        // `x` is the authoritative "bar closed" flag.
        closed: k["x"].as_bool().unwrap_or(false),
    };

    Ok(Some(candle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn history_rows_normalise_time_and_numbers() {
        let body = json!([
            [1700000000123_i64, "37000.00", "37050.00", "36990.00", "37020.00", "123.456", 1700000059999_i64, "0", 10, "0", "0", "0"],
            [1700000060000_i64, 37020.0, 37100.0, 37000.0, 37090.5, 1.5]
        ]);
        let candles = parse_history_rows(&body).unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].time, 1_700_000_000);
        assert!((candles[0].close - 37020.0).abs() < f64::EPSILON);
        assert!(candles[0].closed);
        assert_eq!(candles[1].time, 1_700_000_060);
        assert!((candles[1].volume - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn short_rows_are_skipped() {
        let body = json!([[1000, "1", "1"], [2000, "1", "2", "0.5", "1.5", "3"]]);
        let candles = parse_history_rows(&body).unwrap();
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].time, 2);
    }

    #[test]
    fn non_array_body_is_malformed() {
        let err = parse_history_rows(&json!({"code": -1121, "msg": "Invalid symbol."})).unwrap_err();
        assert!(matches!(err, FeedError::Malformed(_)));
    }

    #[test]
    fn bad_number_fails_the_whole_batch() {
        let body = json!([[1000, "1", "2", "0.5", "abc", "3"]]);
        assert!(parse_history_rows(&body).is_err());
    }

    #[test]
    fn non_finite_prices_are_malformed() {
        for bad in ["NaN", "inf", "-infinity"] {
            let body = json!([[1000, "1", "2", "0.5", bad, "3"]]);
            assert!(matches!(parse_history_rows(&body), Err(FeedError::Malformed(_))));
        }

        let frame = r#"{"k":{"t":60000,"o":"1","h":"NaN","l":"0.5","c":"1.5","v":"9","x":true}}"#;
        assert!(matches!(parse_stream_frame(frame), Err(FeedError::Malformed(_))));
    }

    #[test]
    fn stream_frame_carries_closed_flag() {
        let text = r#"{
            "e": "kline",
            "s": "BTCUSDT",
            "k": {
                "t": 1700000000000, "T": 1700000059999, "i": "1m",
                "o": "37000.00", "h": "37050.00", "l": "36990.00",
                "c": "37020.00", "v": "123.456", "x": true
            }
        }"#;
        let candle = parse_stream_frame(text).unwrap().expect("kline payload");
        assert_eq!(candle.time, 1_700_000_000);
        assert!((candle.high - 37050.0).abs() < f64::EPSILON);
        assert!(candle.closed);
    }

    #[test]
    fn combined_envelope_is_unwrapped() {
        let text = r#"{"stream":"ethusdt@kline_5m","data":{"k":{"t":300000,"o":"1","h":"2","l":"0.5","c":"1.5","v":"9","x":false}}}"#;
        let candle = parse_stream_frame(text).unwrap().unwrap();
        assert_eq!(candle.time, 300);
        assert!(!candle.closed);
    }

    #[test]
    fn frame_without_kline_is_ignored() {
        assert!(parse_stream_frame(r#"{"result":null,"id":1}"#).unwrap().is_none());
    }

    #[test]
    fn garbage_frame_is_an_error() {
        assert!(parse_stream_frame("not json").is_err());
        assert!(parse_stream_frame(r#"{"k":{"t":"x"}}"#).is_err());
    }
}
