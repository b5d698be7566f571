//! Cache Value Codec
//!
//! Rows are cached as a JSON array of the data columns in schema order.
//! Search shards are cached as `"<total> <id> <id> ..."`.

use serde_json::Value as Json;

use crate::error::{Error, Result};
use crate::schema::EntitySchema;
use crate::sql::Row;

/// Encode a normalised data row
pub fn encode_row(schema: &EntitySchema, row: &Row) -> Result<String> {
    let values: Vec<Json> = schema
        .data_columns()
        .iter()
        .zip(row)
        .map(|(column, value)| column.encode(value))
        .collect();
    Ok(serde_json::to_string(&values)?)
}

/// Decode a cached row. `key` is only used for error reporting.
pub fn decode_row(schema: &EntitySchema, key: &str, encoded: &str) -> Result<Row> {
    let codec_error = |reason: String| Error::Codec {
        key: key.to_string(),
        reason,
    };
    let values: Vec<Json> =
        serde_json::from_str(encoded).map_err(|e| codec_error(e.to_string()))?;
    let columns = schema.data_columns();
    if values.len() != columns.len() {
        return Err(codec_error(format!(
            "expected {} columns, got {}",
            columns.len(),
            values.len()
        )));
    }
    columns
        .iter()
        .zip(&values)
        .map(|(column, json)| {
            column
                .decode(json)
                .ok_or_else(|| codec_error(format!("bad value for column '{}'", column.name)))
        })
        .collect()
}

/// Encode one search shard
pub fn encode_shard(total: usize, ids: &[u64]) -> String {
    let mut out = total.to_string();
    for id in ids {
        out.push(' ');
        out.push_str(&id.to_string());
    }
    out
}

/// Decode one search shard into `(total, ids)`
pub fn decode_shard(key: &str, encoded: &str) -> Result<(usize, Vec<u64>)> {
    let mut parts = encoded.split_ascii_whitespace();
    let parse_error = || Error::Codec {
        key: key.to_string(),
        reason: format!("malformed search shard '{}'", encoded),
    };
    let total = parts
        .next()
        .and_then(|t| t.parse().ok())
        .ok_or_else(parse_error)?;
    let ids = parts
        .map(|id| id.parse().map_err(|_| parse_error()))
        .collect::<Result<Vec<u64>>>()?;
    Ok((total, ids))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnKind;
    use crate::value::Value;

    fn schema() -> EntitySchema {
        EntitySchema::builder("User")
            .column("Name", ColumnKind::Str)
            .column("Age", ColumnKind::Int)
            .reference("Friend", "User")
            .build()
            .unwrap()
    }

    #[test]
    fn test_row_codec() {
        let schema = schema();
        let row = vec![Value::from("Tom"), Value::Int(18), Value::Null];
        let encoded = encode_row(&schema, &row).unwrap();
        assert_eq!(encoded, "[\"Tom\",18,null]");
        assert_eq!(decode_row(&schema, "k", &encoded).unwrap(), row);
    }

    #[test]
    fn test_row_codec_errors() {
        let schema = schema();
        assert!(decode_row(&schema, "k", "not json").is_err());
        assert!(decode_row(&schema, "k", "[\"Tom\"]").is_err());
        let err = decode_row(&schema, "k", "[\"Tom\",\"x\",null]").unwrap_err();
        assert!(err.to_string().contains("Age"));
    }

    #[test]
    fn test_shard_codec() {
        assert_eq!(encode_shard(3, &[4, 5, 6]), "3 4 5 6");
        assert_eq!(encode_shard(0, &[]), "0");
        assert_eq!(decode_shard("k", "3 4 5 6").unwrap(), (3, vec![4, 5, 6]));
        assert_eq!(decode_shard("k", "0").unwrap(), (0, vec![]));
        assert!(decode_shard("k", "").is_err());
        assert!(decode_shard("k", "2 x").is_err());
    }
}
