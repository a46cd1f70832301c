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
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Run a query and map every row with `map`, stopping at the first bad row.
pub fn collect_rows<T, P, F>(
    conn: &rusqlite::Connection,
    sql: &str,
    params: P,
    mut map: F,
) -> Result<Vec<T>, StoreError>
where
    P: rusqlite::Params,
    F: FnMut(&rusqlite::Row<'_>) -> Result<T, StoreError>,
{
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(map(row)?);
    }
    Ok(out)
}

/// Current time as stored in `created_at` columns.
pub fn now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    #[test]
    fn get_reports_table_and_column() {
        let db = Database::in_memory().unwrap();
        let err = db
            .with_conn(|conn| {
                collect_rows(conn, "SELECT 'not a number'", [], |row| {
                    get::<i64>(row, 0, "rooms", "created_at")
                })
            })
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::CorruptRow {
                table: "rooms",
                column: "created_at",
                ..
            }
        ));
    }

    #[test]
    fn get_opt_accepts_null() {
        let db = Database::in_memory().unwrap();
        let values = db
            .with_conn(|conn| {
                collect_rows(conn, "SELECT NULL UNION ALL SELECT 'x'", [], |row| {
                    get_opt::<String>(row, 0, "rooms", "created_by")
                })
            })
            .unwrap();
        assert_eq!(values, vec![None, Some("x".to_string())]);
    }

    #[test]
    fn now_is_rfc3339_utc() {
        let ts = now();
        assert!(ts.ends_with('Z'));
        assert!(chrono::DateTime::parse_from_rfc3339(&ts).is_ok());
    }
}
