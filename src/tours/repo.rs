use anyhow::Context;
use serde_json::{json, Map, Value};
use sqlx::{types::Json, PgPool};
use time::{format_description::well_known::Rfc3339, Date, Month, OffsetDateTime};
use uuid::Uuid;

use crate::query::{
    shape::{Page, Projection, VERSION_FIELD},
    DocumentQuery, Op, PgDocumentQuery, Predicate, QueryShape,
};

pub const TABLE: &str = "tours";
/// Fields a patch may never overwrite.
pub const IMMUTABLE_FIELDS: [&str; 2] = ["_id", "createdAt"];

/// Secret tours never show up in any lookup.
pub fn hide_secret() -> Vec<Predicate> {
    vec![Predicate::new("secretTour", Op::Ne, Value::Bool(true))]
}

fn tours(db: &PgPool) -> PgDocumentQuery {
    PgDocumentQuery::new(db.clone(), TABLE).find(hide_secret())
}

pub async fn list(db: &PgPool, shape: &QueryShape) -> anyhow::Result<Vec<Value>> {
    shape.apply(tours(db)).fetch().await
}

pub async fn find_by_id(db: &PgPool, id: Uuid) -> anyhow::Result<Option<Value>> {
    let shape = QueryShape {
        predicates: vec![Predicate::new("_id", Op::Eq, json!(id))],
        sort: Vec::new(),
        projection: Projection::Exclude(vec![VERSION_FIELD.to_string()]),
        page: Page { skip: 0, limit: 1 },
    };
    Ok(shape.apply(tours(db)).fetch().await?.into_iter().next())
}

/// Stamps identity and bookkeeping fields onto a new document.
pub fn new_document(mut body: Map<String, Value>, id: Uuid, now: OffsetDateTime) -> anyhow::Result<Value> {
    body.insert("_id".into(), json!(id));
    body.insert(
        "createdAt".into(),
        Value::String(now.format(&Rfc3339).context("format createdAt")?),
    );
    body.insert(VERSION_FIELD.into(), json!(0));
    Ok(Value::Object(body))
}

pub async fn insert(db: &PgPool, body: Map<String, Value>) -> anyhow::Result<Value> {
    let id = Uuid::new_v4();
    let doc = new_document(body, id, OffsetDateTime::now_utc())?;
    let Json(stored) = sqlx::query_scalar::<_, Json<Value>>(
        r#"
        INSERT INTO tours (id, doc)
        VALUES ($1, $2)
        RETURNING doc - '__v'
        "#,
    )
    .bind(id)
    .bind(Json(doc))
    .fetch_one(db)
    .await
    .context("insert tour")?;
    Ok(stored)
}

pub fn sanitize_patch(mut patch: Map<String, Value>) -> Map<String, Value> {
    for field in IMMUTABLE_FIELDS {
        patch.remove(field);
    }
    patch
}

/// Shallow merge of `patch` into the stored document.
pub async fn update(db: &PgPool, id: Uuid, patch: Map<String, Value>) -> anyhow::Result<Option<Value>> {
    let patch = sanitize_patch(patch);
    let row = sqlx::query_scalar::<_, Json<Value>>(
        r#"
        UPDATE tours
        SET doc = doc || $2
        WHERE id = $1 AND doc -> 'secretTour' IS DISTINCT FROM 'true'::jsonb
        RETURNING doc - '__v'
        "#,
    )
    .bind(id)
    .bind(Json(Value::Object(patch)))
    .fetch_optional(db)
    .await
    .context("update tour")?;
    Ok(row.map(|Json(doc)| doc))
}

pub async fn delete(db: &PgPool, id: Uuid) -> anyhow::Result<bool> {
    let res = sqlx::query(
        r#"
        DELETE FROM tours
        WHERE id = $1 AND doc -> 'secretTour' IS DISTINCT FROM 'true'::jsonb
        "#,
    )
    .bind(id)
    .execute(db)
    .await
    .context("delete tour")?;
    Ok(res.rows_affected() > 0)
}

/// Per-difficulty figures over well-rated tours, cheapest average first.
/// Non-numeric fields are ignored rather than cast.
const STATS_SQL: &str = r#"
    WITH rated AS (
        SELECT
            COALESCE(UPPER(doc ->> 'difficulty'), '') AS difficulty,
            CASE WHEN jsonb_typeof(doc -> 'ratingsQuantity') = 'number'
                 THEN (doc ->> 'ratingsQuantity')::float8 END AS ratings_quantity,
            CASE WHEN jsonb_typeof(doc -> 'ratingsAverage') = 'number'
                 THEN (doc ->> 'ratingsAverage')::float8 END AS ratings_average,
            CASE WHEN jsonb_typeof(doc -> 'price') = 'number'
                 THEN (doc ->> 'price')::float8 END AS price
        FROM tours
        WHERE doc -> 'secretTour' IS DISTINCT FROM 'true'::jsonb
    )
    SELECT jsonb_build_object(
        '_id', difficulty,
        'numTours', COUNT(*),
        'numRatings', COALESCE(SUM(ratings_quantity), 0),
        'avgRating', AVG(ratings_average),
        'avgPrice', AVG(price),
        'minPrice', MIN(price),
        'maxPrice', MAX(price)
    )
    FROM rated
    WHERE ratings_average >= 4.5
    GROUP BY difficulty
    ORDER BY AVG(price) ASC NULLS LAST, difficulty
"#;

/// Tour starts inside `[$1, $2)` grouped by month, busiest month first.
const MONTHLY_PLAN_SQL: &str = r#"
    WITH starts AS (
        SELECT
            doc ->> 'name' AS name,
            CASE WHEN d.value ~ '^\d{4}-\d{2}-\d{2}'
                 THEN d.value::timestamptz END AS starts_at
        FROM tours,
             jsonb_array_elements_text(
                 CASE WHEN jsonb_typeof(doc -> 'startDates') = 'array'
                      THEN doc -> 'startDates' ELSE '[]'::jsonb END
             ) AS d(value)
        WHERE doc -> 'secretTour' IS DISTINCT FROM 'true'::jsonb
    ),
    months AS (
        SELECT EXTRACT(MONTH FROM starts_at AT TIME ZONE 'UTC')::int AS month, name
        FROM starts
        WHERE starts_at >= $1 AND starts_at < $2
    )
    SELECT jsonb_build_object(
        'month', month,
        'numTourStarts', COUNT(*),
        'tours', jsonb_agg(name ORDER BY name)
    )
    FROM months
    GROUP BY month
    ORDER BY COUNT(*) DESC, month
    LIMIT 12
"#;

pub async fn stats(db: &PgPool) -> anyhow::Result<Vec<Value>> {
    let rows = sqlx::query_scalar::<_, Json<Value>>(STATS_SQL)
        .fetch_all(db)
        .await
        .context("tour stats")?;
    Ok(rows.into_iter().map(|Json(doc)| doc).collect())
}

/// Start of `year` and start of the next one, both UTC. `None` outside the calendar range.
pub fn year_bounds(year: i32) -> Option<(OffsetDateTime, OffsetDateTime)> {
    let start = Date::from_calendar_date(year, Month::January, 1).ok()?;
    let end = Date::from_calendar_date(year.checked_add(1)?, Month::January, 1).ok()?;
    Some((start.midnight().assume_utc(), end.midnight().assume_utc()))
}

pub async fn monthly_plan(
    db: &PgPool,
    from: OffsetDateTime,
    until: OffsetDateTime,
) -> anyhow::Result<Vec<Value>> {
    let rows = sqlx::query_scalar::<_, Json<Value>>(MONTHLY_PLAN_SQL)
        .bind(from)
        .bind(until)
        .fetch_all(db)
        .await
        .context("monthly plan")?;
    Ok(rows.into_iter().map(|Json(doc)| doc).collect())
}
