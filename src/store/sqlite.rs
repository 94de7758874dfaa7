//! SQLite-backed document store.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::SqlitePool;

use super::query::{is_valid_field_name, Direction, Filter, Operator, Query};
use super::value::{encode_timestamp, Document, FieldValue};
use super::{DocumentStore, InsertOutcome, StoreError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cf_documents (
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    natural_key TEXT,
    data TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (collection, id)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_cf_documents_natural_key ON cf_documents(collection, natural_key);
CREATE INDEX IF NOT EXISTS idx_cf_documents_created ON cf_documents(collection, created_at)
"#;

/// Document store persisting each record as a type-tagged JSON row.
///
/// Records written through [`DocumentStore::insert_if_absent`] carry a
/// canonical encoding of their key in `natural_key`; the unique index on it
/// turns the find-or-create race into a conflict the database resolves.
#[derive(Clone)]
pub struct SqliteDocumentStore {
    pool: SqlitePool,
    writable: bool,
}

enum Bind {
    Text(String),
    Int(i64),
    Real(f64),
}

impl SqliteDocumentStore {
    /// Create a writable store over the given connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            writable: true,
        }
    }

    /// Create a store that only serves reads.
    pub fn read_only(pool: SqlitePool) -> Self {
        Self {
            pool,
            writable: false,
        }
    }

    /// Run database migrations to create required tables.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        for statement in SCHEMA.split(';') {
            let trimmed = statement.trim();
            if !trimmed.is_empty() {
                sqlx::query(trimmed)
                    .execute(&self.pool)
                    .await
                    .map_err(backend)?;
            }
        }
        Ok(())
    }

    fn ensure_writable(&self, collection: &str) -> Result<(), StoreError> {
        if self.writable {
            Ok(())
        } else {
            Err(StoreError::missing_credentials(format!("insert into {collection}")))
        }
    }

    async fn insert_row(
        &self,
        collection: &str,
        document: &Document,
        natural_key: Option<String>,
    ) -> Result<u64, StoreError> {
        let data = serde_json::to_string(&document.fields_to_wire())
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let result = sqlx::query(
            "INSERT INTO cf_documents (collection, id, natural_key, data) VALUES (?, ?, ?, ?) ON CONFLICT DO NOTHING",
        )
        .bind(collection)
        .bind(&document.id)
        .bind(natural_key)
        .bind(data)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(result.rows_affected())
    }
}

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn decode_row(collection: &str, id: String, data: &str) -> Result<Document, StoreError> {
    let malformed = |reason: String| StoreError::Malformed {
        collection: collection.to_string(),
        field: "data".to_string(),
        reason,
    };
    let value: Value = serde_json::from_str(data).map_err(|e| malformed(e.to_string()))?;
    Document::from_wire(id, &value).map_err(malformed)
}

/// Canonical encoding of an equality key, stable for a given field order.
fn natural_key(key: &[Filter]) -> String {
    let parts: Vec<Value> = key
        .iter()
        .map(|f| Value::Array(vec![Value::String(f.field.clone()), f.value.to_wire()]))
        .collect();
    Value::Array(parts).to_string()
}

fn sql_operator(op: Operator) -> &'static str {
    match op {
        Operator::Eq | Operator::Contains => "=",
        Operator::Gt => ">",
        Operator::Lt => "<",
        Operator::GtEq => ">=",
        Operator::LtEq => "<=",
    }
}

fn compile_filter(filter: &Filter, binds: &mut Vec<Bind>) -> Result<String, StoreError> {
    let field = &filter.field;
    if !is_valid_field_name(field) {
        return Err(StoreError::InvalidQuery(format!("bad field name: {field:?}")));
    }

    if filter.op == Operator::Contains {
        binds.push(Bind::Text(filter.value.to_wire().to_string()));
        return Ok(format!(
            "EXISTS (SELECT 1 FROM json_each(data, '$.{field}.arrayValue.values') WHERE json_each.value = json(?))"
        ));
    }

    let op = sql_operator(filter.op);
    let clause = match &filter.value {
        FieldValue::Null => {
            if filter.op != Operator::Eq {
                return Err(StoreError::InvalidQuery(format!(
                    "null only supports equality (field {field})"
                )));
            }
            format!(
                "(json_type(data, '$.{field}') IS NULL OR json_type(data, '$.{field}.nullValue') = 'null')"
            )
        }
        FieldValue::Boolean(b) => {
            binds.push(Bind::Int(i64::from(*b)));
            format!("json_extract(data, '$.{field}.booleanValue') {op} ?")
        }
        FieldValue::Integer(i) => {
            binds.push(Bind::Int(*i));
            format!("{} {op} ?", numeric_path(field))
        }
        FieldValue::Double(d) => {
            binds.push(Bind::Real(*d));
            format!("{} {op} ?", numeric_path(field))
        }
        FieldValue::Timestamp(t) => {
            binds.push(Bind::Text(encode_timestamp(t)));
            format!("json_extract(data, '$.{field}.timestampValue') {op} ?")
        }
        FieldValue::String(s) => {
            binds.push(Bind::Text(s.clone()));
            format!("json_extract(data, '$.{field}.stringValue') {op} ?")
        }
        FieldValue::Array(_) => {
            if filter.op != Operator::Eq {
                return Err(StoreError::InvalidQuery(format!(
                    "arrays only support equality and contains (field {field})"
                )));
            }
            let inner = filter
                .value
                .to_wire()
                .get("arrayValue")
                .cloned()
                .unwrap_or(Value::Null);
            binds.push(Bind::Text(inner.to_string()));
            format!("json_extract(data, '$.{field}.arrayValue') = json(?)")
        }
    };
    Ok(clause)
}

fn numeric_path(field: &str) -> String {
    format!(
        "COALESCE(json_extract(data, '$.{field}.integerValue'), json_extract(data, '$.{field}.doubleValue'))"
    )
}

fn compile_query(query: &Query) -> Result<(String, Vec<Bind>), StoreError> {
    let mut binds = vec![Bind::Text(query.collection.clone())];
    let mut sql = String::from("SELECT id, data FROM cf_documents WHERE collection = ?");

    for filter in &query.filters {
        sql.push_str(" AND ");
        sql.push_str(&compile_filter(filter, &mut binds)?);
    }

    if let Some(order) = &query.order_by {
        let field = &order.field;
        if !is_valid_field_name(field) {
            return Err(StoreError::InvalidQuery(format!("bad order field: {field:?}")));
        }
        let direction = match order.direction {
            Direction::Ascending => "ASC",
            Direction::Descending => "DESC",
        };
        sql.push_str(&format!(
            " ORDER BY COALESCE(json_extract(data, '$.{field}.integerValue'), json_extract(data, '$.{field}.doubleValue'), json_extract(data, '$.{field}.timestampValue'), json_extract(data, '$.{field}.stringValue'), json_extract(data, '$.{field}.booleanValue')) {direction}, rowid"
        ));
    } else {
        sql.push_str(" ORDER BY rowid");
    }

    if let Some(limit) = query.limit {
        sql.push_str(" LIMIT ?");
        binds.push(Bind::Int(limit as i64));
    }

    Ok((sql, binds))
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    fn describe(&self) -> String {
        format!("sqlite (writable: {})", self.writable)
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT id, data FROM cf_documents WHERE collection = ? AND id = ?")
                .bind(collection)
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?;

        row.map(|(id, data)| decode_row(collection, id, &data))
            .transpose()
    }

    async fn select(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        let (sql, binds) = compile_query(query)?;

        let mut select = sqlx::query_as::<_, (String, String)>(&sql);
        for bind in binds {
            select = match bind {
                Bind::Text(s) => select.bind(s),
                Bind::Int(i) => select.bind(i),
                Bind::Real(f) => select.bind(f),
            };
        }
        let rows = select.fetch_all(&self.pool).await.map_err(backend)?;

        rows.into_iter()
            .map(|(id, data)| decode_row(&query.collection, id, &data))
            .collect()
    }

    async fn insert(&self, collection: &str, document: Document) -> Result<(), StoreError> {
        self.ensure_writable(collection)?;
        let inserted = self.insert_row(collection, &document, None).await?;
        if inserted == 0 {
            return Err(StoreError::Backend(format!(
                "id '{}' already present in '{collection}'",
                document.id
            )));
        }
        Ok(())
    }

    async fn insert_if_absent(
        &self,
        collection: &str,
        key: &[Filter],
        document: Document,
    ) -> Result<InsertOutcome, StoreError> {
        self.ensure_writable(collection)?;

        let inserted = self
            .insert_row(collection, &document, Some(natural_key(key)))
            .await?;
        if inserted == 1 {
            return Ok(InsertOutcome::Inserted(document));
        }

        // Lost the race: the conflicting row is the canonical one.
        let existing = self
            .select(&Query::collection(collection).filters(key.iter().cloned()))
            .await?;
        if existing.is_empty() {
            return Err(StoreError::Backend(format!(
                "conditional insert into '{collection}' conflicted without a matching record"
            )));
        }
        Ok(InsertOutcome::Existing(existing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn natural_key_is_order_sensitive_and_typed() {
        let a = natural_key(&[Filter::eq("name", "x"), Filter::eq("version", "1")]);
        let b = natural_key(&[Filter::eq("name", "x"), Filter::eq("version", 1i64)]);
        assert_ne!(a, b);
        assert!(a.contains("stringValue"));
    }

    #[test]
    fn rejects_unsafe_field_names() {
        let query = Query::collection("event").where_eq("uri') OR 1=1 --", "x");
        assert!(matches!(
            compile_query(&query),
            Err(StoreError::InvalidQuery(_))
        ));
    }
}
