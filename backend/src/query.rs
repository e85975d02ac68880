use std::sync::Arc;

use chrono::{DateTime, Months, TimeDelta, Utc};

use crate::db::{Reading, RecordStore, StoreError};

/// Report window selected by the `timeframe` query parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeframe {
    Day,
    Week,
    Month,
}

impl Timeframe {
    /// Unknown or missing tokens fall back to the last day.
    pub fn from_token(token: Option<&str>) -> Self {
        match token {
            Some("7d") => Timeframe::Week,
            Some("30d") | Some("1mo") => Timeframe::Month,
            _ => Timeframe::Day,
        }
    }

    pub fn start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Timeframe::Day => now - TimeDelta::days(1),
            Timeframe::Week => now - TimeDelta::days(7),
            // calendar month, clamped to the end of shorter months
            Timeframe::Month => now
                .checked_sub_months(Months::new(1))
                .unwrap_or(now - TimeDelta::days(30)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("No data found.")]
    NotFound,
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct QueryService<S> {
    store: Arc<S>,
}

impl<S: RecordStore> QueryService<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub async fn status(&self) -> Result<Reading, QueryError> {
        self.store.latest().await?.ok_or(QueryError::NotFound)
    }

    pub async fn report(&self, timeframe: Option<&str>) -> Result<Vec<Reading>, StoreError> {
        self.report_at(Timeframe::from_token(timeframe), Utc::now())
            .await
    }

    pub async fn report_at(
        &self,
        timeframe: Timeframe,
        now: DateTime<Utc>,
    ) -> Result<Vec<Reading>, StoreError> {
        self.store.range(timeframe.start(now), Some(now)).await
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use common::req::SystemStatus;

    use super::*;
    use crate::db::tests::{reading_at, test_db};

    #[test]
    fn tokens_map_to_windows() {
        assert_eq!(Timeframe::from_token(Some("7d")), Timeframe::Week);
        assert_eq!(Timeframe::from_token(Some("30d")), Timeframe::Month);
        assert_eq!(Timeframe::from_token(Some("1mo")), Timeframe::Month);
        assert_eq!(Timeframe::from_token(Some("24h")), Timeframe::Day);
        assert_eq!(Timeframe::from_token(Some("")), Timeframe::Day);
        assert_eq!(Timeframe::from_token(None), Timeframe::Day);
    }

    #[test]
    fn month_window_is_a_calendar_month() {
        let now = Utc.with_ymd_and_hms(2025, 3, 31, 12, 0, 0).unwrap();
        assert_eq!(
            Timeframe::Month.start(now),
            Utc.with_ymd_and_hms(2025, 2, 28, 12, 0, 0).unwrap()
        );
        assert_eq!(
            Timeframe::Week.start(now),
            Utc.with_ymd_and_hms(2025, 3, 24, 12, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn status_on_empty_store_is_not_found() {
        let queries = QueryService::new(Arc::new(test_db()));
        assert!(matches!(queries.status().await, Err(QueryError::NotFound)));
    }

    #[tokio::test]
    async fn status_returns_the_only_reading() {
        let db = Arc::new(test_db());
        let queries = QueryService::new(db.clone());
        let now = Utc::now();
        let id = db
            .append(reading_at(88.0, SystemStatus::Danger, now))
            .await
            .unwrap();

        let reading = queries.status().await.unwrap();
        assert_eq!(reading.id, id);
        assert_eq!(reading.gas_value, 88.0);
        assert_eq!(reading.system_status, SystemStatus::Danger);
    }

    #[tokio::test]
    async fn report_windows_select_by_age() {
        let db = Arc::new(test_db());
        let queries = QueryService::new(db.clone());
        let now = Utc::now();

        db.append(reading_at(10.0, SystemStatus::Safe, now - TimeDelta::days(10)))
            .await
            .unwrap();
        db.append(reading_at(5.0, SystemStatus::Warning, now - TimeDelta::days(5)))
            .await
            .unwrap();

        let week = queries.report_at(Timeframe::Week, now).await.unwrap();
        let values: Vec<f64> = week.iter().map(|r| r.gas_value).collect();
        assert_eq!(values, vec![5.0]);

        let month = queries.report_at(Timeframe::Month, now).await.unwrap();
        let values: Vec<f64> = month.iter().map(|r| r.gas_value).collect();
        assert_eq!(values, vec![10.0, 5.0]);

        let day = queries.report_at(Timeframe::Day, now).await.unwrap();
        assert!(day.is_empty());
    }

    #[tokio::test]
    async fn report_uses_default_window_for_unknown_token() {
        let db = Arc::new(test_db());
        let queries = QueryService::new(db.clone());
        db.append(reading_at(
            1.0,
            SystemStatus::Safe,
            Utc::now() - TimeDelta::hours(2),
        ))
        .await
        .unwrap();
        db.append(reading_at(
            2.0,
            SystemStatus::Safe,
            Utc::now() - TimeDelta::days(3),
        ))
        .await
        .unwrap();

        let res = queries.report(Some("bogus")).await.unwrap();
        assert_eq!(res.len(), 1);
        assert_eq!(res[0].gas_value, 1.0);
    }
}
