//! Smart folders: faceted views over document classifications.
//!
//! Bucket counts and the optional single-facet filter run in SQL, so the
//! `(org_id, facet)` covering indexes carry the scalar views and the GIN
//! index on `people` carries the person view. Each bucket's documents are
//! then fetched through the same facet-equality predicates. Buckets are
//! ordered by count descending, then facet value.

use diesel::dsl::count_star;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Text};
use serde::Serialize;
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::{Classification, Document};
use crate::schema::{document_classifications, documents};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Facet {
    Team,
    Project,
    DocType,
    Date,
    Person,
}

#[derive(Debug, Serialize)]
pub struct FolderDocument {
    pub doc_id: Uuid,
    pub filename: String,
    pub doc_type: String,
    pub summary: String,
    pub classified_at: String,
}

#[derive(Debug, Serialize)]
pub struct FolderBucket {
    pub facet_value: String,
    pub count: usize,
    pub documents: Vec<FolderDocument>,
}

#[derive(QueryableByName)]
struct PersonCount {
    #[diesel(sql_type = Text)]
    facet_value: String,
    #[diesel(sql_type = BigInt)]
    count: i64,
}

/// Builds the requested view. `filter` narrows the result to one bucket.
pub fn folder_view(
    conn: &mut PgConnection,
    org_id: i64,
    facet: Facet,
    filter: Option<&str>,
) -> AppResult<Vec<FolderBucket>> {
    let mut counts = facet_counts(conn, org_id, facet, filter)?;
    counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let mut view = Vec::with_capacity(counts.len());
    for (facet_value, count) in counts {
        let documents = bucket_documents(conn, org_id, facet, &facet_value)?;
        view.push(FolderBucket {
            facet_value,
            count: count as usize,
            documents,
        });
    }
    Ok(view)
}

macro_rules! grouped_counts {
    ($conn:expr, $org_id:expr, $filter:expr, $column:expr) => {{
        let base = document_classifications::table
            .inner_join(documents::table)
            .filter(document_classifications::org_id.eq($org_id))
            .filter(documents::is_deleted.eq(false))
            .filter($column.is_not_null());
        let rows: Vec<(Option<String>, i64)> = match $filter {
            Some(value) => base
                .filter($column.eq(value))
                .group_by($column)
                .select(($column, count_star()))
                .load($conn)?,
            None => base
                .group_by($column)
                .select(($column, count_star()))
                .load($conn)?,
        };
        rows.into_iter()
            .filter_map(|(value, count)| value.map(|value| (value, count)))
            .collect()
    }};
}

fn facet_counts(
    conn: &mut PgConnection,
    org_id: i64,
    facet: Facet,
    filter: Option<&str>,
) -> AppResult<Vec<(String, i64)>> {
    let counts = match facet {
        Facet::Team => grouped_counts!(conn, org_id, filter, document_classifications::team),
        Facet::Project => grouped_counts!(conn, org_id, filter, document_classifications::project),
        Facet::Date => {
            grouped_counts!(conn, org_id, filter, document_classifications::time_period)
        }
        Facet::DocType => {
            let base = document_classifications::table
                .inner_join(documents::table)
                .filter(document_classifications::org_id.eq(org_id))
                .filter(documents::is_deleted.eq(false));
            let rows: Vec<(String, i64)> = match filter {
                Some(value) => base
                    .filter(document_classifications::doc_type.eq(value))
                    .group_by(document_classifications::doc_type)
                    .select((document_classifications::doc_type, count_star()))
                    .load(conn)?,
                None => base
                    .group_by(document_classifications::doc_type)
                    .select((document_classifications::doc_type, count_star()))
                    .load(conn)?,
            };
            rows
        }
        Facet::Person => person_counts(conn, org_id, filter)?
            .into_iter()
            .map(|row| (row.facet_value, row.count))
            .collect(),
    };
    Ok(counts)
}

/// The person view unnests the `people` array, so one document counts under
/// every name it mentions.
fn person_counts(
    conn: &mut PgConnection,
    org_id: i64,
    filter: Option<&str>,
) -> QueryResult<Vec<PersonCount>> {
    match filter {
        Some(person) => diesel::sql_query(
            "SELECT person AS facet_value, count(*) AS count \
             FROM document_classifications dc \
             JOIN documents d ON d.id = dc.document_id \
             CROSS JOIN LATERAL unnest(dc.people) AS person \
             WHERE dc.org_id = $1 AND NOT d.is_deleted AND person = $2 \
             GROUP BY person",
        )
        .bind::<BigInt, _>(org_id)
        .bind::<Text, _>(person)
        .load(conn),
        None => diesel::sql_query(
            "SELECT person AS facet_value, count(*) AS count \
             FROM document_classifications dc \
             JOIN documents d ON d.id = dc.document_id \
             CROSS JOIN LATERAL unnest(dc.people) AS person \
             WHERE dc.org_id = $1 AND NOT d.is_deleted \
             GROUP BY person",
        )
        .bind::<BigInt, _>(org_id)
        .load(conn),
    }
}

fn bucket_documents(
    conn: &mut PgConnection,
    org_id: i64,
    facet: Facet,
    facet_value: &str,
) -> AppResult<Vec<FolderDocument>> {
    let base = document_classifications::table
        .inner_join(documents::table)
        .filter(document_classifications::org_id.eq(org_id))
        .filter(documents::is_deleted.eq(false));

    let rows: Vec<(Classification, Document)> = match facet {
        Facet::Team => base
            .filter(document_classifications::team.eq(facet_value))
            .load(conn)?,
        Facet::Project => base
            .filter(document_classifications::project.eq(facet_value))
            .load(conn)?,
        Facet::DocType => base
            .filter(document_classifications::doc_type.eq(facet_value))
            .load(conn)?,
        Facet::Date => base
            .filter(document_classifications::time_period.eq(facet_value))
            .load(conn)?,
        Facet::Person => base
            .filter(document_classifications::people.contains(vec![facet_value.to_string()]))
            .load(conn)?,
    };

    Ok(rows
        .into_iter()
        .map(|(classification, document)| FolderDocument {
            doc_id: document.id,
            filename: document.filename,
            doc_type: classification.doc_type,
            summary: classification.summary,
            classified_at: format!(
                "{}Z",
                classification.classified_at.format("%Y-%m-%dT%H:%M:%S")
            ),
        })
        .collect())
}
