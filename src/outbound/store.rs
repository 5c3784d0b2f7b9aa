//! MySQL persistence for outbound reminder jobs.
//!
//! Connections are opened per operation and dropped immediately; the
//! controller spends minutes between touches and holding a pool open
//! across them buys nothing.

use chrono::NaiveDate;
use sqlx::{mysql::MySqlConnection, Connection, Row};
use std::{error::Error as StdError, fmt};
use tracing::{debug, info, warn};

/// One dispatchable row from the subscriber table.
#[derive(Clone, Debug)]
pub struct OutboundJob {
    pub id: u64,
    /// E.164 destination, already validated and `57`-prefixed.
    pub phone: String,
    /// Attempt count persisted by previous runs.
    pub prior_attempts: u32,
    /// Billing cut day-of-month, as stored (may be absent or junk).
    pub cut_day: Option<u32>,
    pub client: Option<String>,
    pub debt: f64,
}

/// A subscriber row with outstanding debt, before today's dispatch
/// policy has been applied. Used by both the dispatcher and the dry-run
/// planner.
#[derive(Clone, Debug)]
pub struct Candidate {
    pub id: u64,
    pub name: String,
    /// The phone exactly as stored.
    pub raw_phone: String,
    /// The trunk-ready phone, when the stored one validates.
    pub phone: Option<String>,
    pub prior_attempts: u32,
    pub cut_day: Option<u32>,
    pub debt: f64,
    /// Why this subscriber will not be called today, if so.
    pub exclusion: Option<String>,
}

impl Candidate {
    /// Whether today's batch may dial this subscriber.
    #[must_use]
    pub fn dispatchable(&self) -> bool {
        self.exclusion.is_none()
    }

    fn into_job(self) -> Option<OutboundJob> {
        let phone = self.phone?;

        Some(OutboundJob {
            id: self.id,
            phone,
            prior_attempts: self.prior_attempts,
            cut_day: self.cut_day,
            client: if self.name.is_empty() {
                None
            } else {
                Some(self.name)
            },
            debt: self.debt,
        })
    }
}

/// Errors from the job store.
#[derive(Debug)]
pub enum StoreError {
    Db(sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Db(e)
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Db(e) => write!(f, "job store query failed: {e}"),
        }
    }
}

impl StdError for StoreError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            StoreError::Db(e) => Some(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Whether the cut-day policy allows calling today.
///
/// Calls go out from the day before the cut day until three days after
/// it: `(d == c-1 || d >= c) && c >= d-3`.
#[must_use]
pub fn cut_day_allows(today: u32, cut_day: u32) -> bool {
    let d = i64::from(today);
    let c = i64::from(cut_day);

    (d == c - 1 || d >= c) && c >= d - 3
}

/// Validates a raw stored phone as a Colombian mobile and formats it for
/// the trunk: exactly 10 digits starting with `3`, prefixed with `57`.
#[must_use]
pub fn format_phone(raw: &str) -> Option<String> {
    let trimmed = raw.trim();

    if trimmed.len() == 10
        && trimmed.starts_with('3')
        && trimmed.bytes().all(|b| b.is_ascii_digit())
    {
        Some(format!("57{trimmed}"))
    } else {
        None
    }
}

/// The subscriber table, reached over short-lived connections.
#[derive(Clone)]
pub struct SubscriberStore {
    dsn: String,
}

impl SubscriberStore {
    #[must_use]
    pub fn new(dsn: String) -> Self {
        Self { dsn }
    }

    async fn connect(&self) -> Result<MySqlConnection> {
        Ok(MySqlConnection::connect(&self.dsn).await?)
    }

    /// Loads every undispatched subscriber with outstanding debt and
    /// applies today's policy, recording exclusion reasons instead of
    /// dropping rows.
    pub async fn load_candidates(&self, today_day: u32) -> Result<Vec<Candidate>> {
        let mut conn = self.connect().await?;

        let rows = sqlx::query(
            "SELECT a.id, a.telefono, a.outbound_call_attempts, a.corte, a.cliente, a.apellido, \
                    CAST(SUM(CASE WHEN f.cerrado = 0 THEN f.saldo ELSE 0 END) AS DOUBLE) AS deuda_total \
             FROM afiliados a \
             LEFT JOIN factura f ON a.id = f.`id-afiliado` \
             WHERE a.outbound_call = 1 \
               AND a.outbound_call_is_sent = 0 \
               AND a.activo = 1 \
               AND a.eliminar = 0 \
             GROUP BY a.id, a.telefono, a.outbound_call_attempts, a.corte, a.cliente, a.apellido \
             HAVING deuda_total > 0 \
             ORDER BY a.id",
        )
        .fetch_all(&mut conn)
        .await?;

        conn.close().await.ok();

        let mut candidates = Vec::with_capacity(rows.len());

        for row in rows {
            let id: u64 = row
                .try_get::<u64, _>("id")
                .or_else(|_| row.try_get::<i64, _>("id").map(|v| v.max(0) as u64))?;
            let raw_phone: String = row.try_get("telefono").unwrap_or_default();
            let prior_attempts: u32 = row
                .try_get::<i64, _>("outbound_call_attempts")
                .map(|v| v.max(0) as u32)
                .unwrap_or(0);
            let cut_raw: Option<String> = row.try_get("corte").ok();
            let first: Option<String> = row.try_get("cliente").ok();
            let last: Option<String> = row.try_get("apellido").ok();
            let debt: f64 = row.try_get("deuda_total").unwrap_or(0.0);

            let name = [first.unwrap_or_default(), last.unwrap_or_default()]
                .join(" ")
                .trim()
                .to_owned();

            let cut_day = cut_raw.as_deref().and_then(|c| c.trim().parse::<u32>().ok());
            let phone = format_phone(&raw_phone);

            let exclusion = match cut_day {
                Some(cut) if !cut_day_allows(today_day, cut) => Some(format!(
                    "cut day {cut} outside today's window (day {today_day})"
                )),
                _ if phone.is_none() => Some(format!("invalid mobile number {raw_phone:?}")),
                _ => None,
            };

            candidates.push(Candidate {
                id,
                name,
                raw_phone,
                phone,
                prior_attempts,
                cut_day,
                debt,
                exclusion,
            });
        }

        Ok(candidates)
    }

    /// Loads the jobs today's batch may dial, plus how many rows the
    /// policy excluded.
    ///
    /// Exclusions are logged here, before dispatch.
    pub async fn load_pending(&self, today_day: u32) -> Result<(Vec<OutboundJob>, usize)> {
        let candidates = self.load_candidates(today_day).await?;

        let mut jobs = Vec::new();
        let mut skipped = 0usize;

        for candidate in candidates {
            if let Some(reason) = &candidate.exclusion {
                debug!("Subscriber {} skipped: {reason}.", candidate.id);
                skipped += 1;
                continue;
            }

            match candidate.into_job() {
                Some(job) => {
                    info!(
                        "Subscriber {}: {}, debt {:.2}, cut day {:?}.",
                        job.id, job.phone, job.debt, job.cut_day,
                    );
                    jobs.push(job);
                },
                None => {
                    // Unreachable in practice: no exclusion implies a
                    // validated phone.
                    warn!("Candidate lost its phone between validation and dispatch.");
                    skipped += 1;
                },
            }
        }

        Ok((jobs, skipped))
    }

    /// Records a delivered reminder: the success flag, the completion
    /// date, and the attempt count, in one write.
    ///
    /// Called exactly once per job, at the first `PlaybackStarted`.
    pub async fn mark_sent(&self, job_id: u64, attempts: u32, date: NaiveDate) -> Result<()> {
        let mut conn = self.connect().await?;

        sqlx::query(
            "UPDATE afiliados \
             SET outbound_call_is_sent = 1, \
                 outbound_call_attempts = ?, \
                 outbound_call_completed_at = ? \
             WHERE id = ?",
        )
        .bind(attempts)
        .bind(date)
        .bind(job_id)
        .execute(&mut conn)
        .await?;

        conn.close().await.ok();

        info!("Job {job_id} marked sent (attempt {attempts}, {date}).");
        Ok(())
    }

    /// Records the attempt count for a job that exhausted its retries.
    ///
    /// Never touches the sent flag; only the monthly reset clears it.
    pub async fn record_attempts(&self, job_id: u64, attempts: u32) -> Result<()> {
        let mut conn = self.connect().await?;

        sqlx::query("UPDATE afiliados SET outbound_call_attempts = ? WHERE id = ?")
            .bind(attempts)
            .bind(job_id)
            .execute(&mut conn)
            .await?;

        conn.close().await.ok();

        info!("Job {job_id} attempts updated to {attempts}.");
        Ok(())
    }
}

impl fmt::Debug for SubscriberStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cut_day_window() {
        // Day before the cut.
        assert!(cut_day_allows(14, 15));
        // On the cut day.
        assert!(cut_day_allows(15, 15));
        // Up to three days past the cut.
        assert!(cut_day_allows(17, 15));
        assert!(cut_day_allows(18, 15));
        // Beyond that, the billing cycle has moved on.
        assert!(!cut_day_allows(19, 15));
        // Too far before the cut.
        assert!(!cut_day_allows(10, 15));
        // Month-end vs. start-of-month cut: excluded by the window rule.
        assert!(!cut_day_allows(31, 1));
    }

    #[test]
    fn phone_validation() {
        assert_eq!(
            format_phone("3001234567").as_deref(),
            Some("573001234567")
        );
        assert_eq!(format_phone(" 3001234567 ").as_deref(), Some("573001234567"));
        // Wrong leading digit.
        assert_eq!(format_phone("6001234567"), None);
        // Wrong length.
        assert_eq!(format_phone("300123456"), None);
        assert_eq!(format_phone("30012345678"), None);
        // Non-digits.
        assert_eq!(format_phone("30012345a7"), None);
        assert_eq!(format_phone(""), None);
    }

    #[test]
    fn candidate_exclusions_drive_dispatchability() {
        let callable = Candidate {
            id: 1,
            name: "Ana Pérez".into(),
            raw_phone: "3001234567".into(),
            phone: Some("573001234567".into()),
            prior_attempts: 0,
            cut_day: Some(15),
            debt: 82_000.0,
            exclusion: None,
        };
        assert!(callable.dispatchable());

        let job = callable.into_job().unwrap();
        assert_eq!(job.phone, "573001234567");
        assert_eq!(job.client.as_deref(), Some("Ana Pérez"));

        let excluded = Candidate {
            id: 2,
            name: String::new(),
            raw_phone: "123".into(),
            phone: None,
            prior_attempts: 1,
            cut_day: Some(15),
            debt: 10_000.0,
            exclusion: Some("invalid mobile number \"123\"".into()),
        };
        assert!(!excluded.dispatchable());
        assert!(excluded.into_job().is_none());
    }
}
