use crate::error::StoreError;

/// Get a required column value from a row, returning CorruptRow on failure.
pub fn get<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Get an optional column value.
pub fn get_opt<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<Option<T>, StoreError> {
    get(row, idx, table, column)
}

/// Parse a JSON string column, returning CorruptRow on parse failure.
pub fn parse_json<T: serde::de::DeserializeOwned>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: format!("invalid JSON: {e}"),
    })
}

/// Parse a string into an enum, returning CorruptRow on failure.
pub fn parse_enum<T: std::str::FromStr>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    raw.parse().map_err(|_| StoreError::CorruptRow {
        table,
        column,
        detail: format!("unknown variant: {raw}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_core::Mode;

    #[test]
    fn parse_enum_success() {
        let mode: Mode = parse_enum("deep", "sessions", "mode").unwrap();
        assert_eq!(mode, Mode::Deep);
    }

    #[test]
    fn parse_enum_failure() {
        let result: Result<Mode, _> = parse_enum("INVALID!", "sessions", "mode");
        assert!(matches!(
            result,
            Err(StoreError::CorruptRow { table: "sessions", column: "mode", .. })
        ));
    }

    #[test]
    fn parse_json_success() {
        let topics: Vec<String> = parse_json(r#"["music","travel"]"#, "memories", "topics").unwrap();
        assert_eq!(topics, vec!["music", "travel"]);
    }

    #[test]
    fn parse_json_failure() {
        let result: Result<serde_json::Value, _> = parse_json("not valid json", "audit_events", "payload");
        assert!(matches!(
            result,
            Err(StoreError::CorruptRow { table: "audit_events", column: "payload", .. })
        ));
    }
}
