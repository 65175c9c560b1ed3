//! SQLx-backed [`ConsumerStore`] implementations for the two entity kinds.
//!
//! These write to the downstream service's own tables, keyed by the
//! normalized natural key. They are deliberately dumb: all idempotency
//! decisions live in [`IdempotentApplier`], the stores only answer
//! exists/insert/update/delete for one key.
//!
//! [`IdempotentApplier`]: crate::IdempotentApplier

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::Row;

use billsync_envelope::{BusinessFields, InvoicePayload, Payload, UserPayload};

use crate::error::{ConsumerError, ConsumerResult};
use crate::ConsumerStore;

/// Client mirror table maintained by user-kind consumers.
pub struct SqlxClientStore {
    pool: PgPool,
}

impl SqlxClientStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn user_payload(payload: &Payload) -> ConsumerResult<&UserPayload> {
        match payload {
            Payload::User(user) => Ok(user),
            Payload::Invoice(_) => Err(ConsumerError::PayloadMismatch),
        }
    }
}

fn business_field<'a>(
    business: &'a Option<BusinessFields>,
    pick: impl Fn(&'a BusinessFields) -> &'a Option<String>,
) -> Option<&'a str> {
    business.as_ref().and_then(|b| pick(b).as_deref())
}

#[async_trait]
impl ConsumerStore for SqlxClientStore {
    async fn exists(&self, key: &str) -> ConsumerResult<bool> {
        let row = sqlx::query("SELECT EXISTS(SELECT 1 FROM clients WHERE natural_key = $1)")
            .bind(key)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<bool, _>(0)?)
    }

    async fn insert(&self, key: &str, payload: &Payload) -> ConsumerResult<()> {
        let user = Self::user_payload(payload)?;
        sqlx::query(
            r#"
            INSERT INTO clients (
                natural_key, encrypted_password, first_name, last_name,
                phone, email, business_name, business_email,
                business_address, btw_number, facturation_address
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(key)
        .bind(user.encrypted_password.as_deref())
        .bind(user.first_name.as_deref())
        .bind(user.last_name.as_deref())
        .bind(user.phone.as_deref())
        .bind(user.email.as_deref())
        .bind(business_field(&user.business, |b| &b.name))
        .bind(business_field(&user.business, |b| &b.email))
        .bind(business_field(&user.business, |b| &b.real_address))
        .bind(business_field(&user.business, |b| &b.btw_number))
        .bind(business_field(&user.business, |b| &b.facturation_address))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update(&self, key: &str, payload: &Payload) -> ConsumerResult<bool> {
        let user = Self::user_payload(payload)?;
        // COALESCE keeps the stored value wherever the envelope omitted the
        // field, so partial updates never blank out columns.
        let result = sqlx::query(
            r#"
            UPDATE clients SET
                encrypted_password = COALESCE($2, encrypted_password),
                first_name = COALESCE($3, first_name),
                last_name = COALESCE($4, last_name),
                phone = COALESCE($5, phone),
                email = COALESCE($6, email),
                business_name = COALESCE($7, business_name),
                business_email = COALESCE($8, business_email),
                business_address = COALESCE($9, business_address),
                btw_number = COALESCE($10, btw_number),
                facturation_address = COALESCE($11, facturation_address),
                updated_at = NOW()
            WHERE natural_key = $1
            "#,
        )
        .bind(key)
        .bind(user.encrypted_password.as_deref())
        .bind(user.first_name.as_deref())
        .bind(user.last_name.as_deref())
        .bind(user.phone.as_deref())
        .bind(user.email.as_deref())
        .bind(business_field(&user.business, |b| &b.name))
        .bind(business_field(&user.business, |b| &b.email))
        .bind(business_field(&user.business, |b| &b.real_address))
        .bind(business_field(&user.business, |b| &b.btw_number))
        .bind(business_field(&user.business, |b| &b.facturation_address))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, key: &str) -> ConsumerResult<bool> {
        let result = sqlx::query("DELETE FROM clients WHERE natural_key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Invoice mirror tables maintained by invoice-kind consumers. Line items
/// live in a child table and are replaced wholesale on update, inside one
/// transaction with the parent row.
pub struct SqlxInvoiceStore {
    pool: PgPool,
}

impl SqlxInvoiceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn invoice_payload(payload: &Payload) -> ConsumerResult<&InvoicePayload> {
        match payload {
            Payload::Invoice(invoice) => Ok(invoice),
            Payload::User(_) => Err(ConsumerError::PayloadMismatch),
        }
    }

    async fn insert_lines(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        invoice_id: i64,
        invoice: &InvoicePayload,
    ) -> ConsumerResult<()> {
        for line in &invoice.products {
            sqlx::query(
                r#"
                INSERT INTO invoice_lines (invoice_id, product_nr, quantity, unit_price)
                VALUES ($1, $2, $3, $4::NUMERIC)
                "#,
            )
            .bind(invoice_id)
            .bind(&line.product_nr)
            .bind(line.quantity as i32)
            .bind(&line.unit_price)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ConsumerStore for SqlxInvoiceStore {
    async fn exists(&self, key: &str) -> ConsumerResult<bool> {
        let row = sqlx::query("SELECT EXISTS(SELECT 1 FROM invoices WHERE natural_key = $1)")
            .bind(key)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<bool, _>(0)?)
    }

    async fn insert(&self, key: &str, payload: &Payload) -> ConsumerResult<()> {
        let invoice = Self::invoice_payload(payload)?;
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("INSERT INTO invoices (natural_key) VALUES ($1) RETURNING id")
            .bind(key)
            .fetch_one(&mut *tx)
            .await?;
        let invoice_id: i64 = row.try_get("id")?;
        Self::insert_lines(&mut tx, invoice_id, invoice).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn update(&self, key: &str, payload: &Payload) -> ConsumerResult<bool> {
        let invoice = Self::invoice_payload(payload)?;
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "UPDATE invoices SET updated_at = NOW() WHERE natural_key = $1 RETURNING id",
        )
        .bind(key)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(false);
        };
        let invoice_id: i64 = row.try_get("id")?;

        sqlx::query("DELETE FROM invoice_lines WHERE invoice_id = $1")
            .bind(invoice_id)
            .execute(&mut *tx)
            .await?;
        Self::insert_lines(&mut tx, invoice_id, invoice).await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn delete(&self, key: &str) -> ConsumerResult<bool> {
        // invoice_lines go with the parent via ON DELETE CASCADE.
        let result = sqlx::query("DELETE FROM invoices WHERE natural_key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
