//! SMS and email delivery-tracking persistence, including the retry-sweep
//! queries the dispatch loops poll.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use crate::delivery::email::EmailMessage;
use crate::delivery::sms::{SmsMessage, SmsProvider};
use crate::delivery::DeliveryStatus;

use super::DatabaseManager;

fn status_from_str(s: &str) -> Result<DeliveryStatus> {
    Ok(match s {
        "pending" => DeliveryStatus::Pending,
        "queued" => DeliveryStatus::Queued,
        "sent" => DeliveryStatus::Sent,
        "delivered" => DeliveryStatus::Delivered,
        "failed" => DeliveryStatus::Failed,
        "bounced" => DeliveryStatus::Bounced,
        "spam" => DeliveryStatus::Spam,
        "unsubscribed" => DeliveryStatus::Unsubscribed,
        other => return Err(anyhow::anyhow!("unknown delivery status: {other}")),
    })
}

fn status_to_str(s: DeliveryStatus) -> &'static str {
    match s {
        DeliveryStatus::Pending => "pending",
        DeliveryStatus::Queued => "queued",
        DeliveryStatus::Sent => "sent",
        DeliveryStatus::Delivered => "delivered",
        DeliveryStatus::Failed => "failed",
        DeliveryStatus::Bounced => "bounced",
        DeliveryStatus::Spam => "spam",
        DeliveryStatus::Unsubscribed => "unsubscribed",
    }
}

fn parse_dt(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.map(|s| DateTime::parse_from_rfc3339(&s).map(|dt| dt.with_timezone(&Utc)))
        .transpose()
        .map_err(Into::into)
}

fn sms_provider_from_str(s: &str) -> Result<SmsProvider> {
    Ok(match s {
        "twilio" => SmsProvider::Twilio,
        "sipgate" => SmsProvider::Sipgate,
        other => return Err(anyhow::anyhow!("unknown sms provider: {other}")),
    })
}

fn sms_provider_to_str(p: SmsProvider) -> &'static str {
    match p {
        SmsProvider::Twilio => "twilio",
        SmsProvider::Sipgate => "sipgate",
    }
}

fn sms_from_row(row: &SqliteRow) -> Result<SmsMessage> {
    let id: String = row.try_get("id")?;
    let tenant_id: String = row.try_get("tenant_id")?;
    let status: String = row.try_get("status")?;
    let provider: String = row.try_get("provider")?;
    let queued_at: String = row.try_get("queued_at")?;
    Ok(SmsMessage {
        id: Uuid::parse_str(&id)?,
        tenant_id: Uuid::parse_str(&tenant_id)?,
        to_number: row.try_get("to_number")?,
        body: row.try_get("body")?,
        status: status_from_str(&status)?,
        provider: sms_provider_from_str(&provider)?,
        provider_message_id: row.try_get("provider_message_id")?,
        retry_count: row.try_get::<i64, _>("retry_count")? as u32,
        next_retry_at: parse_dt(row.try_get("next_retry_at")?)?,
        queued_at: DateTime::parse_from_rfc3339(&queued_at)?.with_timezone(&Utc),
        sent_at: parse_dt(row.try_get("sent_at")?)?,
        delivered_at: parse_dt(row.try_get("delivered_at")?)?,
        error_code: row.try_get("error_code")?,
    })
}

fn email_from_row(row: &SqliteRow) -> Result<EmailMessage> {
    let id: String = row.try_get("id")?;
    let tenant_id: String = row.try_get("tenant_id")?;
    let status: String = row.try_get("status")?;
    let queued_at: String = row.try_get("queued_at")?;
    Ok(EmailMessage {
        id: Uuid::parse_str(&id)?,
        tenant_id: Uuid::parse_str(&tenant_id)?,
        to_address: row.try_get("to_address")?,
        subject: row.try_get("subject")?,
        body: row.try_get("body")?,
        status: status_from_str(&status)?,
        provider_message_id: row.try_get("provider_message_id")?,
        retry_count: row.try_get::<i64, _>("retry_count")? as u32,
        next_retry_at: parse_dt(row.try_get("next_retry_at")?)?,
        queued_at: DateTime::parse_from_rfc3339(&queued_at)?.with_timezone(&Utc),
        sent_at: parse_dt(row.try_get("sent_at")?)?,
        delivered_at: parse_dt(row.try_get("delivered_at")?)?,
        bounce_reason: row.try_get("bounce_reason")?,
    })
}

impl DatabaseManager {
    pub async fn upsert_sms_message(&self, message: &SmsMessage) -> Result<()> {
        sqlx::query(
            "INSERT INTO sms_messages
                (id, tenant_id, to_number, body, status, provider, provider_message_id,
                 retry_count, next_retry_at, queued_at, sent_at, delivered_at, error_code)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                provider_message_id = excluded.provider_message_id,
                retry_count = excluded.retry_count,
                next_retry_at = excluded.next_retry_at,
                sent_at = excluded.sent_at,
                delivered_at = excluded.delivered_at,
                error_code = excluded.error_code",
        )
        .bind(message.id.to_string())
        .bind(message.tenant_id.to_string())
        .bind(&message.to_number)
        .bind(&message.body)
        .bind(status_to_str(message.status))
        .bind(sms_provider_to_str(message.provider))
        .bind(&message.provider_message_id)
        .bind(message.retry_count as i64)
        .bind(message.next_retry_at.map(|d| d.to_rfc3339()))
        .bind(message.queued_at.to_rfc3339())
        .bind(message.sent_at.map(|d| d.to_rfc3339()))
        .bind(message.delivered_at.map(|d| d.to_rfc3339()))
        .bind(&message.error_code)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_sms_by_provider_id(&self, provider_message_id: &str) -> Result<Option<SmsMessage>> {
        let row = sqlx::query("SELECT * FROM sms_messages WHERE provider_message_id = ?")
            .bind(provider_message_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(sms_from_row).transpose()
    }

    /// Messages due for a retry sweep: sitting in `failed`, still under
    /// `max_retries`, with a scheduled `next_retry_at` that has passed.
    /// Matches `get_retryable`'s `status in (failed, undelivered) and
    /// retry_count < max_retries` query rather than `pending` — a failed
    /// send stays `failed` while it waits out its backoff instead of
    /// reverting. A `NULL` `next_retry_at` means no retry was ever
    /// scheduled (a non-retryable, permanent failure) and is excluded
    /// rather than swept forever.
    pub async fn list_retryable_sms(&self, now: DateTime<Utc>, max_retries: u32) -> Result<Vec<SmsMessage>> {
        let rows = sqlx::query(
            "SELECT * FROM sms_messages
             WHERE status = 'failed' AND retry_count < ? AND next_retry_at IS NOT NULL AND next_retry_at <= ?",
        )
        .bind(max_retries as i64)
        .bind(now.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(sms_from_row).collect()
    }

    pub async fn upsert_email_message(&self, message: &EmailMessage) -> Result<()> {
        sqlx::query(
            "INSERT INTO email_messages
                (id, tenant_id, to_address, subject, body, status, provider_message_id,
                 retry_count, next_retry_at, queued_at, sent_at, delivered_at, bounce_reason)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                provider_message_id = excluded.provider_message_id,
                retry_count = excluded.retry_count,
                next_retry_at = excluded.next_retry_at,
                sent_at = excluded.sent_at,
                delivered_at = excluded.delivered_at,
                bounce_reason = excluded.bounce_reason",
        )
        .bind(message.id.to_string())
        .bind(message.tenant_id.to_string())
        .bind(&message.to_address)
        .bind(&message.subject)
        .bind(&message.body)
        .bind(status_to_str(message.status))
        .bind(&message.provider_message_id)
        .bind(message.retry_count as i64)
        .bind(message.next_retry_at.map(|d| d.to_rfc3339()))
        .bind(message.queued_at.to_rfc3339())
        .bind(message.sent_at.map(|d| d.to_rfc3339()))
        .bind(message.delivered_at.map(|d| d.to_rfc3339()))
        .bind(&message.bounce_reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_email_by_provider_id(&self, provider_message_id: &str) -> Result<Option<EmailMessage>> {
        let row = sqlx::query("SELECT * FROM email_messages WHERE provider_message_id = ?")
            .bind(provider_message_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(email_from_row).transpose()
    }

    /// Email counterpart to `list_retryable_sms`, used by the same retry
    /// sweeper loop.
    pub async fn list_retryable_email(&self, now: DateTime<Utc>, max_retries: u32) -> Result<Vec<EmailMessage>> {
        let rows = sqlx::query(
            "SELECT * FROM email_messages
             WHERE status = 'failed' AND retry_count < ? AND next_retry_at IS NOT NULL AND next_retry_at <= ?",
        )
        .bind(max_retries as i64)
        .bind(now.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(email_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::tenants::Tenant;

    async fn seed_tenant(db: &DatabaseManager) -> Uuid {
        let tenant_id = Uuid::new_v4();
        db.insert_tenant(&Tenant {
            id: tenant_id,
            name: "Praxis".to_string(),
            industry: "medical".to_string(),
            timezone: "Europe/Berlin".to_string(),
            active: true,
            created_at: Utc::now(),
        })
        .await
        .unwrap();
        tenant_id
    }

    #[tokio::test]
    async fn sms_upsert_then_lookup_by_provider_id() {
        let db = DatabaseManager::new_in_memory().await.unwrap();
        let tenant_id = seed_tenant(&db).await;
        let mut message = SmsMessage::new(
            tenant_id,
            "+491701234567".to_string(),
            "Erinnerung".to_string(),
            SmsProvider::Twilio,
            Utc::now(),
        );
        message.provider_message_id = Some("SM123".to_string());
        db.upsert_sms_message(&message).await.unwrap();
        let fetched = db.get_sms_by_provider_id("SM123").await.unwrap().unwrap();
        assert_eq!(fetched.id, message.id);
    }

    #[tokio::test]
    async fn retryable_sms_excludes_future_retry_and_exhausted() {
        let db = DatabaseManager::new_in_memory().await.unwrap();
        let tenant_id = seed_tenant(&db).await;
        let now = Utc::now();

        let mut due = SmsMessage::new(tenant_id, "+4917011".to_string(), "a".to_string(), SmsProvider::Twilio, now);
        due.status = crate::delivery::DeliveryStatus::Failed;
        due.next_retry_at = Some(now - chrono::Duration::minutes(1));

        let mut future = SmsMessage::new(tenant_id, "+4917022".to_string(), "b".to_string(), SmsProvider::Twilio, now);
        future.status = crate::delivery::DeliveryStatus::Failed;
        future.next_retry_at = Some(now + chrono::Duration::hours(1));

        let mut exhausted = SmsMessage::new(tenant_id, "+4917033".to_string(), "c".to_string(), SmsProvider::Twilio, now);
        exhausted.status = crate::delivery::DeliveryStatus::Failed;
        exhausted.retry_count = 3;
        exhausted.next_retry_at = Some(now - chrono::Duration::minutes(1));

        let mut permanent = SmsMessage::new(tenant_id, "+4917044".to_string(), "d".to_string(), SmsProvider::Twilio, now);
        permanent.status = crate::delivery::DeliveryStatus::Failed;
        permanent.next_retry_at = None;

        db.upsert_sms_message(&due).await.unwrap();
        db.upsert_sms_message(&future).await.unwrap();
        db.upsert_sms_message(&exhausted).await.unwrap();
        db.upsert_sms_message(&permanent).await.unwrap();

        let retryable = db.list_retryable_sms(now, 3).await.unwrap();
        assert_eq!(retryable.len(), 1);
        assert_eq!(retryable[0].id, due.id);
    }
}
