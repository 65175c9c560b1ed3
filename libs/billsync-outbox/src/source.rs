//! Read access to the system of record.
//!
//! The source schema is owned by the billing side and consumed here as a
//! narrow contract: load the fields an envelope needs, and write back a
//! synthesized natural key. Nothing else about the schema is assumed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use billsync_envelope::{
    BusinessFields, InvoicePayload, NaturalKey, Payload, ProductLine, UserPayload,
};

use crate::{OutboxEntry, OutboxError, OutboxResult};

/// What the poller needs from the source to build an envelope.
#[derive(Debug, Clone)]
pub struct SourceRecord {
    /// Stored natural key, if the entity already has one
    pub natural_key: Option<NaturalKey>,
    /// Creation time, the deterministic fallback for key synthesis
    pub created_at: DateTime<Utc>,
    pub payload: Payload,
}

/// Row-level read/write against the system of record for one entity kind.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Load the record an outbox entry refers to. Missing rows are an
    /// error: the entry will be retried until the source is fixed.
    async fn load(&self, entry: &OutboxEntry) -> OutboxResult<SourceRecord>;

    /// Persist a synthesized natural key back onto the entity so repeated
    /// polls derive the same key.
    async fn store_natural_key(&self, entity_id: i64, key: &NaturalKey) -> OutboxResult<()>;
}

/// Treat the empty strings the billing schema uses for absent values as
/// absent, so they are omitted from envelopes instead of emitted empty.
fn none_if_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// [`ChangeSource`] over the billing `client` table.
pub struct SqlxClientSource {
    pool: PgPool,
}

impl SqlxClientSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChangeSource for SqlxClientSource {
    async fn load(&self, entry: &OutboxEntry) -> OutboxResult<SourceRecord> {
        let row = sqlx::query(
            r#"
            SELECT natural_key, created_at, first_name, last_name, email, pass, phone,
                   company, company_vat,
                   CONCAT_WS(', ', address_1, city, country) AS address
            FROM client
            WHERE id = $1
            "#,
        )
        .bind(entry.entity_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(OutboxError::EntityMissing {
            entry_id: entry.id,
            entity_id: entry.entity_id,
        })?;

        let email = none_if_empty(row.try_get("email")?);
        let company = none_if_empty(row.try_get("company")?);
        let vat = none_if_empty(row.try_get("company_vat")?);
        let address = none_if_empty(row.try_get("address")?);

        // The Business block exists only when at least one business
        // attribute does; business email and facturation address fall back
        // to their personal counterparts.
        let business = if company.is_some() || vat.is_some() || address.is_some() {
            Some(BusinessFields {
                name: company,
                email: email.clone(),
                real_address: address.clone(),
                btw_number: vat,
                facturation_address: address,
            })
        } else {
            None
        };

        let natural_key = row
            .try_get::<Option<String>, _>("natural_key")?
            .map(NaturalKey::new)
            .transpose()?;

        Ok(SourceRecord {
            natural_key,
            created_at: row.try_get("created_at")?,
            payload: Payload::User(UserPayload {
                encrypted_password: none_if_empty(row.try_get("pass")?),
                first_name: none_if_empty(row.try_get("first_name")?),
                last_name: none_if_empty(row.try_get("last_name")?),
                phone: none_if_empty(row.try_get("phone")?),
                email,
                business,
            }),
        })
    }

    async fn store_natural_key(&self, entity_id: i64, key: &NaturalKey) -> OutboxResult<()> {
        sqlx::query("UPDATE client SET natural_key = $2 WHERE id = $1")
            .bind(entity_id)
            .bind(key.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// [`ChangeSource`] over the billing `invoice` and `invoice_item` tables.
pub struct SqlxInvoiceSource {
    pool: PgPool,
}

impl SqlxInvoiceSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChangeSource for SqlxInvoiceSource {
    async fn load(&self, entry: &OutboxEntry) -> OutboxResult<SourceRecord> {
        let invoice = sqlx::query(
            r#"
            SELECT natural_key, created_at
            FROM invoice
            WHERE id = $1
            "#,
        )
        .bind(entry.entity_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(OutboxError::EntityMissing {
            entry_id: entry.id,
            entity_id: entry.entity_id,
        })?;

        let lines = sqlx::query(
            r#"
            SELECT product_nr, quantity, unit_price::TEXT AS unit_price
            FROM invoice_item
            WHERE invoice_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(entry.entity_id)
        .fetch_all(&self.pool)
        .await?;

        let products = lines
            .iter()
            .map(|row| {
                Ok(ProductLine {
                    product_nr: row.try_get("product_nr")?,
                    quantity: row.try_get::<i32, _>("quantity")?.max(0) as u32,
                    unit_price: row.try_get("unit_price")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;

        let natural_key = invoice
            .try_get::<Option<String>, _>("natural_key")?
            .map(NaturalKey::new)
            .transpose()?;

        Ok(SourceRecord {
            natural_key,
            created_at: invoice.try_get("created_at")?,
            payload: Payload::Invoice(InvoicePayload { products }),
        })
    }

    async fn store_natural_key(&self, entity_id: i64, key: &NaturalKey) -> OutboxResult<()> {
        sqlx::query("UPDATE invoice SET natural_key = $2 WHERE id = $1")
            .bind(entity_id)
            .bind(key.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
