//! Row visibility
//!
//! Decides which channel a decoded change is delivered on. Tables without
//! RLS broadcast on the table channel. RLS tables broadcast on
//! `table.<scope>`, where the scope is read from the row's RLS column; a
//! row without a usable scope value reaches nobody. Bootstrap reads apply
//! the same rule through [`SnapshotQuery`].

use solarflare_common::change::ChangeEvent;
use solarflare_common::error::{Error, Result};
use solarflare_common::types::{channel_name, quote_ident, Row, ScopeKey, TableInfo};
use tracing::debug;

/// Read the scope key of `row` for an RLS table.
///
/// Returns `Ok(None)` for tables without RLS and for rows whose RLS column
/// is null. A row that lacks the column entirely is an error.
pub fn scope_for_row(info: &TableInfo, row: &Row) -> Result<Option<ScopeKey>> {
    let Some(column) = info.rls.as_deref() else {
        return Ok(None);
    };
    let value = row.get(column).ok_or_else(|| Error::MissingRlsColumn {
        table: info.table.clone(),
        column: column.to_string(),
    })?;
    Ok(ScopeKey::from_value(value))
}

/// Channel a change is broadcast on, or `None` when no subscriber may see it
pub fn route(info: &TableInfo, event: &ChangeEvent) -> Result<Option<String>> {
    if !info.rls_enabled() {
        return Ok(Some(channel_name(&info.table, None)));
    }

    match scope_for_row(info, &event.row)? {
        Some(scope) => Ok(Some(channel_name(&info.table, Some(&scope)))),
        None => {
            debug!(
                table = %info.table,
                kind = ?event.kind,
                "Row has no scope value, change not delivered"
            );
            Ok(None)
        }
    }
}

/// Whether the decoded row carries the table's primary key
pub fn has_primary_key(info: &TableInfo, event: &ChangeEvent) -> bool {
    event.row.get(&info.pk).is_some_and(|v| !v.is_null())
}

/// SQL for a bootstrap read, scoped the same way changes are routed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotQuery {
    pub sql: String,
    /// Bound as `$1` when present
    pub scope: Option<String>,
}

impl SnapshotQuery {
    pub fn new(info: &TableInfo, scope: Option<&ScopeKey>) -> Self {
        let base = format!(
            "SELECT row_to_json(t)::text FROM {} AS t",
            info.table.sql_identifier()
        );

        match (info.rls.as_deref(), scope) {
            (Some(column), Some(scope)) => Self {
                sql: format!("{base} WHERE t.{}::text = $1", quote_ident(column)),
                scope: Some(scope.as_str().to_string()),
            },
            // An RLS table read without a scope matches no rows.
            (Some(_), None) => Self {
                sql: format!("{base} WHERE false"),
                scope: None,
            },
            (None, _) => Self { sql: base, scope: None },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use solarflare_common::change::ChangeKind;
    use solarflare_common::types::TableRef;

    fn row(value: serde_json::Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn event(kind: ChangeKind, value: serde_json::Value) -> ChangeEvent {
        ChangeEvent {
            table: TableRef::public("employees"),
            kind,
            row: row(value),
        }
    }

    fn employees() -> TableInfo {
        TableInfo::new(
            TableRef::public("employees"),
            "id",
            Some("user_id".to_string()),
        )
    }

    #[test]
    fn test_route_without_rls() {
        let info = TableInfo::new(TableRef::public("todos"), "id", None);
        let e = event(ChangeKind::Insert, json!({"id": 1, "text": "a"}));
        assert_eq!(route(&info, &e).unwrap().as_deref(), Some("todos"));
    }

    #[test]
    fn test_route_with_rls() {
        let e = event(ChangeKind::Update, json!({"id": 1, "user_id": 2}));
        assert_eq!(
            route(&employees(), &e).unwrap().as_deref(),
            Some("employees.2")
        );
    }

    #[test]
    fn test_route_delete_uses_old_keys() {
        let e = event(ChangeKind::Delete, json!({"id": 1, "user_id": "u-7"}));
        assert_eq!(
            route(&employees(), &e).unwrap().as_deref(),
            Some("employees.u-7")
        );
    }

    #[test]
    fn test_missing_rls_column_is_error() {
        let e = event(ChangeKind::Delete, json!({"id": 1}));
        assert!(matches!(
            route(&employees(), &e),
            Err(Error::MissingRlsColumn { .. })
        ));
    }

    #[test]
    fn test_null_scope_reaches_nobody() {
        let e = event(ChangeKind::Insert, json!({"id": 1, "user_id": null}));
        assert_eq!(route(&employees(), &e).unwrap(), None);
    }

    #[test]
    fn test_has_primary_key() {
        let info = employees();
        assert!(has_primary_key(&info, &event(ChangeKind::Insert, json!({"id": 3}))));
        assert!(!has_primary_key(&info, &event(ChangeKind::Insert, json!({"name": "x"}))));
    }

    #[test]
    fn test_snapshot_query() {
        let scope = ScopeKey::from_value(&json!(2)).unwrap();
        let scoped = SnapshotQuery::new(&employees(), Some(&scope));
        assert_eq!(
            scoped.sql,
            r#"SELECT row_to_json(t)::text FROM "public"."employees" AS t WHERE t."user_id"::text = $1"#
        );
        assert_eq!(scoped.scope.as_deref(), Some("2"));

        let info = TableInfo::new(TableRef::new("app", "todos"), "id", None);
        let all = SnapshotQuery::new(&info, None);
        assert_eq!(all.sql, r#"SELECT row_to_json(t)::text FROM "app"."todos" AS t"#);
        assert!(all.scope.is_none());

        let unscoped = SnapshotQuery::new(&employees(), None);
        assert!(unscoped.sql.ends_with("WHERE false"));
    }
}
