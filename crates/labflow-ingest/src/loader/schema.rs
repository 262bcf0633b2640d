//! DDL for the results relation and the ledger
//!
//! Every statement is idempotent so the loader can run it on any startup.

use crate::config::TableNames;
use crate::normalizer::Field;

/// Columns written by the loader, in bind order
pub fn insert_columns() -> Vec<&'static str> {
    Field::ALL
        .iter()
        .map(|f| f.column())
        .chain(std::iter::once("natural_key"))
        .collect()
}

fn column_type(field: Field) -> &'static str {
    match field {
        Field::TestDatetime | Field::ResultReceivedDate => "TIMESTAMP NOT NULL",
        Field::Ct1 | Field::Ct2 | Field::Ct3 => "DOUBLE PRECISION NOT NULL DEFAULT 0",
        _ => "TEXT NOT NULL",
    }
}

/// Statements that create both relations and their indexes
pub fn create_statements(tables: &TableNames) -> Vec<String> {
    let results = &tables.results;
    let columns: Vec<String> = Field::ALL
        .iter()
        .map(|f| format!("    {} {}", f.column(), column_type(*f)))
        .collect();

    vec![
        format!(
            "CREATE TABLE IF NOT EXISTS {results} (\n    \
             row_id BIGSERIAL PRIMARY KEY,\n{},\n    \
             natural_key CHAR(64) NOT NULL,\n    \
             loaded_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),\n    \
             CONSTRAINT {results}_natural_key_uq UNIQUE (natural_key)\n)",
            columns.join(",\n")
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {results}_test_datetime_lot_idx \
             ON {results} (test_datetime, lot)"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    \
             inbox TEXT NOT NULL,\n    \
             filename TEXT NOT NULL,\n    \
             committed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),\n    \
             checksum CHAR(64) NOT NULL,\n    \
             record_count BIGINT NOT NULL,\n    \
             PRIMARY KEY (inbox, filename)\n)",
            tables.ledger
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_columns_end_with_natural_key() {
        let columns = insert_columns();
        assert_eq!(columns.len(), 19);
        assert_eq!(columns[0], "test_datetime");
        assert_eq!(columns[18], "natural_key");
    }

    #[test]
    fn test_create_statements_use_configured_names() {
        let tables = TableNames {
            results: "results_t".to_string(),
            ledger: "ledger_t".to_string(),
        };
        let statements = create_statements(&tables);

        assert_eq!(statements.len(), 3);
        assert!(statements[0].starts_with("CREATE TABLE IF NOT EXISTS results_t"));
        assert!(statements[0].contains("ct2 DOUBLE PRECISION NOT NULL DEFAULT 0"));
        assert!(statements[0].contains("UNIQUE (natural_key)"));
        assert!(statements[0].contains("loaded_at TIMESTAMPTZ"));
        assert!(statements[1].contains("ON results_t (test_datetime, lot)"));
        assert!(statements[2].contains("CREATE TABLE IF NOT EXISTS ledger_t"));
        assert!(statements[2].contains("PRIMARY KEY (inbox, filename)"));
    }
}
