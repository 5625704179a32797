use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{types::Json, PgPool, Postgres, QueryBuilder};

use super::shape::{Op, Predicate, Projection, SortKey};

/// Chainable query over a document collection, resolved by `fetch`.
#[async_trait]
pub trait DocumentQuery: Sized + Send {
    /// Adds predicates; all of them must hold.
    fn find(self, predicates: Vec<Predicate>) -> Self;
    fn sort(self, keys: Vec<SortKey>) -> Self;
    fn select(self, projection: Projection) -> Self;
    fn skip(self, n: u64) -> Self;
    fn limit(self, n: u64) -> Self;
    async fn fetch(self) -> anyhow::Result<Vec<Value>>;
}

/// Documents stored as `(id uuid, doc jsonb)` rows.
#[derive(Debug, Clone)]
pub struct PgDocumentQuery {
    pool: PgPool,
    table: &'static str,
    predicates: Vec<Predicate>,
    sort: Vec<SortKey>,
    projection: Option<Projection>,
    skip: Option<u64>,
    limit: Option<u64>,
}

impl PgDocumentQuery {
    pub fn new(pool: PgPool, table: &'static str) -> Self {
        Self {
            pool,
            table,
            predicates: Vec::new(),
            sort: Vec::new(),
            projection: None,
            skip: None,
            limit: None,
        }
    }

    pub(crate) fn build(&self) -> QueryBuilder<'static, Postgres> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT ");

        match &self.projection {
            None => {
                qb.push("doc");
            }
            Some(Projection::Exclude(fields)) => {
                qb.push("doc - ");
                qb.push_bind(fields.clone());
                qb.push("::text[]");
            }
            Some(Projection::Include(fields)) => {
                qb.push(
                    "COALESCE((SELECT jsonb_object_agg(e.key, e.value) FROM jsonb_each(doc) e \
                     WHERE e.key = '_id' OR e.key = ANY(",
                );
                qb.push_bind(fields.clone());
                qb.push("::text[])), '{}'::jsonb)");
            }
        }

        qb.push(" AS doc FROM ");
        qb.push(self.table);

        for (i, p) in self.predicates.iter().enumerate() {
            qb.push(if i == 0 { " WHERE " } else { " AND " });
            if p.op == Op::In {
                qb.push_bind(Json(p.value.clone()));
                qb.push("::jsonb @> jsonb_build_array(doc -> ");
                qb.push_bind(p.field.clone());
                qb.push("::text)");
                continue;
            }
            qb.push("doc -> ");
            qb.push_bind(p.field.clone());
            qb.push("::text ");
            qb.push(p.op.sql());
            qb.push(" ");
            qb.push_bind(Json(p.value.clone()));
            qb.push("::jsonb");
        }

        qb.push(" ORDER BY ");
        for key in &self.sort {
            qb.push("doc -> ");
            qb.push_bind(key.field.clone());
            qb.push(if key.desc { "::text DESC, " } else { "::text ASC, " });
        }
        qb.push("id");

        if let Some(skip) = self.skip {
            qb.push(" OFFSET ");
            qb.push_bind(sql_bound(skip));
        }
        if let Some(limit) = self.limit {
            qb.push(" LIMIT ");
            qb.push_bind(sql_bound(limit));
        }
        qb
    }
}

fn sql_bound(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

#[async_trait]
impl DocumentQuery for PgDocumentQuery {
    fn find(mut self, predicates: Vec<Predicate>) -> Self {
        self.predicates.extend(predicates);
        self
    }

    fn sort(mut self, keys: Vec<SortKey>) -> Self {
        self.sort = keys;
        self
    }

    fn select(mut self, projection: Projection) -> Self {
        self.projection = Some(projection);
        self
    }

    fn skip(mut self, n: u64) -> Self {
        self.skip = Some(n);
        self
    }

    fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    async fn fetch(self) -> anyhow::Result<Vec<Value>> {
        let mut qb = self.build();
        let rows = qb
            .build_query_scalar::<Json<Value>>()
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("fetch documents from {}", self.table))?;
        Ok(rows.into_iter().map(|Json(doc)| doc).collect())
    }
}
