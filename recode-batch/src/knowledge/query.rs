//! Typed query path over conversion_records
//!
//! Filters are expressed as methods and compiled to a parameterized query;
//! filter values are always bound, never interpolated into SQL text.

use super::{record_from_row, ConversionRecord, KnowledgeError, KnowledgeStore};
use chrono::{DateTime, Utc};
use sqlx::QueryBuilder;

/// Sort order for query results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderBy {
    CreatedAtDesc,
    CreatedAtAsc,
    SavingDesc,
    SavingAsc,
}

impl OrderBy {
    fn sql(self) -> &'static str {
        match self {
            OrderBy::CreatedAtDesc => "created_at DESC",
            OrderBy::CreatedAtAsc => "created_at ASC",
            OrderBy::SavingDesc => "actual_saving_percent DESC",
            OrderBy::SavingAsc => "actual_saving_percent ASC",
        }
    }
}

/// Filterable, sortable read path used by tuning and diagnostics
pub struct RecordQuery<'a> {
    store: &'a KnowledgeStore,
    format: Option<String>,
    predictor: Option<String>,
    rule: Option<String>,
    validation_passed: Option<bool>,
    date_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    min_saving: Option<f64>,
    order: OrderBy,
    limit: i64,
}

impl KnowledgeStore {
    /// Start a new record query (default: newest first, limit 100)
    pub fn query(&self) -> RecordQuery<'_> {
        RecordQuery {
            store: self,
            format: None,
            predictor: None,
            rule: None,
            validation_passed: None,
            date_range: None,
            min_saving: None,
            order: OrderBy::CreatedAtDesc,
            limit: 100,
        }
    }
}

impl<'a> RecordQuery<'a> {
    pub fn format(mut self, format: &str) -> Self {
        self.format = Some(format.to_string());
        self
    }

    pub fn predictor(mut self, predictor: &str) -> Self {
        self.predictor = Some(predictor.to_string());
        self
    }

    pub fn rule(mut self, rule: &str) -> Self {
        self.rule = Some(rule.to_string());
        self
    }

    pub fn validation_passed(mut self, passed: bool) -> Self {
        self.validation_passed = Some(passed);
        self
    }

    pub fn date_range(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.date_range = Some((from, to));
        self
    }

    /// Only records that saved more than this fraction
    pub fn saving_greater_than(mut self, fraction: f64) -> Self {
        self.min_saving = Some(fraction);
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order = order;
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    /// Run the query
    pub async fn fetch(self) -> Result<Vec<ConversionRecord>, KnowledgeError> {
        let mut builder: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new("SELECT * FROM conversion_records WHERE 1=1");

        if let Some(format) = &self.format {
            builder.push(" AND original_format = ").push_bind(format.clone());
        }
        if let Some(predictor) = &self.predictor {
            builder.push(" AND predictor_name = ").push_bind(predictor.clone());
        }
        if let Some(rule) = &self.rule {
            builder.push(" AND prediction_rule = ").push_bind(rule.clone());
        }
        if let Some(passed) = self.validation_passed {
            builder.push(" AND validation_passed = ").push_bind(passed);
        }
        if let Some((from, to)) = &self.date_range {
            builder
                .push(" AND created_at BETWEEN ")
                .push_bind(from.to_rfc3339())
                .push(" AND ")
                .push_bind(to.to_rfc3339());
        }
        if let Some(min_saving) = self.min_saving {
            builder.push(" AND actual_saving_percent > ").push_bind(min_saving);
        }

        builder.push(" ORDER BY ");
        builder.push(self.order.sql());
        builder.push(" LIMIT ").push_bind(self.limit);

        let rows = builder.build().fetch_all(self.store.pool()).await?;
        Ok(rows.iter().map(record_from_row).collect())
    }
}

impl KnowledgeStore {
    /// Highest-saving validated conversions for a format
    pub async fn best_conversions(
        &self,
        format: &str,
        limit: i64,
    ) -> Result<Vec<ConversionRecord>, KnowledgeError> {
        self.query()
            .format(format)
            .validation_passed(true)
            .order_by(OrderBy::SavingDesc)
            .limit(limit)
            .fetch()
            .await
    }

    /// Lowest-saving conversions for a format, validated or not
    pub async fn worst_conversions(
        &self,
        format: &str,
        limit: i64,
    ) -> Result<Vec<ConversionRecord>, KnowledgeError> {
        self.query()
            .format(format)
            .order_by(OrderBy::SavingAsc)
            .limit(limit)
            .fetch()
            .await
    }

    /// Most recent conversions attributed to one predictor
    pub async fn recent_by_predictor(
        &self,
        predictor: &str,
        limit: i64,
    ) -> Result<Vec<ConversionRecord>, KnowledgeError> {
        self.query()
            .predictor(predictor)
            .order_by(OrderBy::CreatedAtDesc)
            .limit(limit)
            .fetch()
            .await
    }

    /// Conversions whose output failed the quality check
    pub async fn failed_conversions(
        &self,
        limit: i64,
    ) -> Result<Vec<ConversionRecord>, KnowledgeError> {
        self.query()
            .validation_passed(false)
            .order_by(OrderBy::CreatedAtDesc)
            .limit(limit)
            .fetch()
            .await
    }
}
