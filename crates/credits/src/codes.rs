//! Code Registry
//!
//! Generates, stores and validates lifetime-deal redemption codes. Codes are
//! created in batches, tagged with a tier (1-4), optionally expire and carry a
//! redemption limit. `current_redemptions` is only ever written by the
//! redemption processor; the registry reads it.

use repurpose_shared::types::{LtdTier, UserId};
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::audit::{action, AdminAction, AdminAuditLog};
use crate::error::{CreditError, CreditResult};
use crate::outcome::RejectionReason;

/// Largest batch a single generation call may create
pub const MAX_BATCH_QUANTITY: u32 = 1000;

/// Longest accepted code string
pub const MAX_CODE_LENGTH: usize = 64;

/// Regeneration attempts per code before the batch is abandoned
const MAX_GENERATION_ATTEMPTS: u32 = 10;

const CODE_COLUMNS: &str = "id, code, tier, batch_id, max_redemptions, current_redemptions, \
     expires_at, is_active, notes, created_by_admin_id, created_at, updated_at";

// =============================================================================
// Types
// =============================================================================

/// A stored redemption code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct LtdCode {
    pub id: i64,
    pub code: String,
    pub tier: i32,
    pub batch_id: String,
    pub max_redemptions: i32,
    pub current_redemptions: i32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    pub is_active: bool,
    pub notes: Option<String>,
    pub created_by_admin_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Why a code cannot be redeemed right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeDefect {
    NotFound,
    Disabled,
    Expired,
    Exhausted,
}

impl CodeDefect {
    pub fn message(&self) -> &'static str {
        match self {
            CodeDefect::NotFound => "Code not found",
            CodeDefect::Disabled => "Code has been deactivated",
            CodeDefect::Expired => "Code has expired",
            CodeDefect::Exhausted => "Code has reached its redemption limit",
        }
    }
}

impl LtdCode {
    /// Usable iff active, below its limit and not yet expired
    pub fn defect_at(&self, now: OffsetDateTime) -> Option<CodeDefect> {
        if !self.is_active {
            Some(CodeDefect::Disabled)
        } else if self.expires_at.is_some_and(|at| at <= now) {
            Some(CodeDefect::Expired)
        } else if self.current_redemptions >= self.max_redemptions {
            Some(CodeDefect::Exhausted)
        } else {
            None
        }
    }

    pub fn ltd_tier(&self) -> CreditResult<LtdTier> {
        Ok(LtdTier::for_code(self.tier)?)
    }
}

/// Result of `validate_code`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CodeValidation {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectionReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub defect: Option<CodeDefect>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<LtdTier>,
}

impl CodeValidation {
    fn usable(tier: LtdTier) -> Self {
        Self {
            valid: true,
            reason: None,
            defect: None,
            tier: Some(tier),
        }
    }

    fn defective(defect: CodeDefect) -> Self {
        Self {
            valid: false,
            reason: Some(RejectionReason::CodeInvalid),
            defect: Some(defect),
            tier: None,
        }
    }
}

/// Parameters for batch generation
#[derive(Debug, Clone, Deserialize)]
pub struct GenerateCodesRequest {
    pub tier: i32,
    pub quantity: u32,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub max_redemptions: Option<i32>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Result of a generation call
#[derive(Debug, Clone, Serialize)]
pub struct GeneratedBatch {
    pub batch_id: String,
    pub codes: Vec<LtdCode>,
}

/// Target of a bulk operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeSelector {
    Batch(String),
    Ids(Vec<i64>),
}

impl CodeSelector {
    fn validate(&self) -> CreditResult<()> {
        match self {
            CodeSelector::Batch(batch) if batch.trim().is_empty() => Err(
                CreditError::InvalidInput("batch id must not be empty".into()),
            ),
            CodeSelector::Ids(ids) if ids.is_empty() => Err(CreditError::InvalidInput(
                "at least one code id is required".into(),
            )),
            _ => Ok(()),
        }
    }

    fn describe(&self) -> String {
        match self {
            CodeSelector::Batch(batch) => batch.clone(),
            CodeSelector::Ids(ids) => format!("{} codes", ids.len()),
        }
    }

    fn binds(&self) -> (Option<&str>, Option<&[i64]>) {
        match self {
            CodeSelector::Batch(batch) => (Some(batch.as_str()), None),
            CodeSelector::Ids(ids) => (None, Some(ids.as_slice())),
        }
    }
}

/// Derived lifecycle state used by list filters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeStatusFilter {
    Active,
    Expired,
    Redeemed,
    Disabled,
}

impl CodeStatusFilter {
    fn as_str(&self) -> &'static str {
        match self {
            CodeStatusFilter::Active => "active",
            CodeStatusFilter::Expired => "expired",
            CodeStatusFilter::Redeemed => "redeemed",
            CodeStatusFilter::Disabled => "disabled",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CodeFilter {
    pub tier: Option<i32>,
    pub status: Option<CodeStatusFilter>,
    pub batch_id: Option<String>,
    pub search: Option<String>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CodePage {
    pub codes: Vec<LtdCode>,
    pub total: i64,
    pub page: i64,
    pub total_pages: i64,
}

/// Admin-editable fields of a code
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CodeUpdate {
    pub max_redemptions: Option<i32>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub clear_expiry: bool,
    pub is_active: Option<bool>,
    pub notes: Option<String>,
}

impl CodeUpdate {
    fn is_empty(&self) -> bool {
        self.max_redemptions.is_none()
            && self.expires_at.is_none()
            && !self.clear_expiry
            && self.is_active.is_none()
            && self.notes.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize, sqlx::FromRow)]
pub struct CodeStatistics {
    pub total_codes: i64,
    pub active_codes: i64,
    pub redeemed_codes: i64,
    pub fully_redeemed: i64,
    pub expired_codes: i64,
    pub total_redemptions: i64,
    pub tier1_codes: i64,
    pub tier2_codes: i64,
    pub tier3_codes: i64,
    pub tier4_codes: i64,
}

// =============================================================================
// Pure helpers
// =============================================================================

/// Canonical form of a user-supplied code: trimmed, upper-cased, `A-Z0-9-_` only
pub fn normalize_code(input: &str) -> CreditResult<String> {
    let code = input.trim().to_ascii_uppercase();
    if code.is_empty() {
        return Err(CreditError::InvalidInput("code must not be empty".into()));
    }
    if code.len() > MAX_CODE_LENGTH {
        return Err(CreditError::InvalidInput(format!(
            "code must be at most {} characters",
            MAX_CODE_LENGTH
        )));
    }
    let allowed = |c: char| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '-' || c == '_';
    if !code.chars().all(allowed) {
        return Err(CreditError::InvalidInput(
            "code may only contain letters, digits, '-' and '_'".into(),
        ));
    }
    Ok(code)
}

/// Default prefix, e.g. `LTD-T2-`
pub fn default_prefix(tier: LtdTier) -> String {
    format!("LTD-T{}-", tier.get())
}

/// `{prefix}XXXX-XXXX` from four random bytes
pub fn format_code(prefix: &str, random: [u8; 4]) -> String {
    let hex = hex::encode_upper(random);
    format!("{}{}-{}", prefix, &hex[..4], &hex[4..])
}

/// `BATCH-{unix millis}-{8 hex}`
pub fn format_batch_id(now: OffsetDateTime, random: [u8; 4]) -> String {
    let millis = now.unix_timestamp_nanos() / 1_000_000;
    format!("BATCH-{}-{}", millis, hex::encode(random))
}

fn validated_prefix(prefix: Option<&str>, tier: LtdTier) -> CreditResult<String> {
    let prefix = match prefix.map(str::trim) {
        None | Some("") => return Ok(default_prefix(tier)),
        Some(p) => p,
    };
    // Room for the 9-character random suffix
    let normalized = normalize_code(prefix)?;
    if normalized.len() + 9 > MAX_CODE_LENGTH {
        return Err(CreditError::InvalidInput("prefix is too long".into()));
    }
    Ok(normalized)
}

/// Validated generation parameters
#[derive(Debug, Clone, PartialEq, Eq)]
struct GenerationPlan {
    tier: LtdTier,
    quantity: u32,
    prefix: String,
    max_redemptions: i32,
    expires_at: Option<OffsetDateTime>,
    notes: Option<String>,
}

impl GenerationPlan {
    fn from_request(req: &GenerateCodesRequest, now: OffsetDateTime) -> CreditResult<Self> {
        let tier = LtdTier::for_code(req.tier)?;
        if !(1..=MAX_BATCH_QUANTITY).contains(&req.quantity) {
            return Err(CreditError::InvalidInput(format!(
                "Quantity must be between 1 and {}",
                MAX_BATCH_QUANTITY
            )));
        }
        let max_redemptions = req.max_redemptions.unwrap_or(1);
        if max_redemptions < 1 {
            return Err(CreditError::InvalidInput(
                "max_redemptions must be at least 1".into(),
            ));
        }
        if req.expires_at.is_some_and(|at| at <= now) {
            return Err(CreditError::InvalidInput(
                "expires_at must be in the future".into(),
            ));
        }

        Ok(Self {
            tier,
            quantity: req.quantity,
            prefix: validated_prefix(req.prefix.as_deref(), tier)?,
            max_redemptions,
            expires_at: req.expires_at,
            notes: req.notes.clone().filter(|n| !n.trim().is_empty()),
        })
    }
}

// =============================================================================
// Registry
// =============================================================================

#[derive(Clone)]
pub struct CodeRegistry {
    pool: PgPool,
    audit: AdminAuditLog,
}

impl CodeRegistry {
    pub fn new(pool: PgPool, audit: AdminAuditLog) -> Self {
        Self { pool, audit }
    }

    /// Generate a batch of codes sharing one batch id. Audited.
    pub async fn generate_codes(
        &self,
        req: GenerateCodesRequest,
        admin_id: UserId,
    ) -> CreditResult<GeneratedBatch> {
        let now = OffsetDateTime::now_utc();
        let audit = AdminAction::new(admin_id, action::GENERATE_CODES).details(serde_json::json!({
            "tier": req.tier,
            "quantity": req.quantity,
            "max_redemptions": req.max_redemptions.unwrap_or(1),
        }));

        let result = match GenerationPlan::from_request(&req, now) {
            Ok(plan) => self.insert_batch(&plan, admin_id, now).await,
            Err(e) => Err(e),
        };

        let audit = match &result {
            Ok(batch) => audit.target(batch.batch_id.clone()),
            Err(_) => audit,
        };
        self.audit.record_attempt(audit, result).await
    }

    async fn insert_batch(
        &self,
        plan: &GenerationPlan,
        admin_id: UserId,
        now: OffsetDateTime,
    ) -> CreditResult<GeneratedBatch> {
        let batch_id = format_batch_id(now, rand::random::<[u8; 4]>());
        let mut tx = self.pool.begin().await?;
        let mut codes = Vec::with_capacity(plan.quantity as usize);

        for _ in 0..plan.quantity {
            let code = Self::insert_unique(&mut tx, plan, &batch_id, admin_id).await?;
            codes.push(code);
        }

        tx.commit().await?;

        tracing::info!(
            batch_id = %batch_id,
            tier = plan.tier.get(),
            quantity = plan.quantity,
            admin_id = %admin_id,
            "Generated redemption codes"
        );

        Ok(GeneratedBatch { batch_id, codes })
    }

    /// Insert one code, regenerating the random part on collision
    async fn insert_unique(
        conn: &mut PgConnection,
        plan: &GenerationPlan,
        batch_id: &str,
        admin_id: UserId,
    ) -> CreditResult<LtdCode> {
        for attempt in 1..=MAX_GENERATION_ATTEMPTS {
            let candidate = format_code(&plan.prefix, rand::random::<[u8; 4]>());
            let inserted: Option<LtdCode> = sqlx::query_as(&format!(
                r#"
                INSERT INTO ltd_codes (
                    code, tier, batch_id, max_redemptions, expires_at,
                    is_active, notes, created_by_admin_id
                ) VALUES ($1, $2, $3, $4, $5, TRUE, $6, $7)
                ON CONFLICT (code) DO NOTHING
                RETURNING {}
                "#,
                CODE_COLUMNS
            ))
            .bind(&candidate)
            .bind(i32::from(plan.tier))
            .bind(batch_id)
            .bind(plan.max_redemptions)
            .bind(plan.expires_at)
            .bind(&plan.notes)
            .bind(admin_id.0)
            .fetch_optional(&mut *conn)
            .await?;

            match inserted {
                Some(code) => return Ok(code),
                None => tracing::debug!(attempt, code = %candidate, "Code collision, regenerating"),
            }
        }

        Err(CreditError::Internal(format!(
            "Failed to generate unique code after {} attempts",
            MAX_GENERATION_ATTEMPTS
        )))
    }

    pub async fn find_by_code(&self, code: &str) -> CreditResult<Option<LtdCode>> {
        let code: Option<LtdCode> = sqlx::query_as(&format!(
            "SELECT {} FROM ltd_codes WHERE code = $1",
            CODE_COLUMNS
        ))
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(code)
    }

    /// Lock a code row inside a plan mutation (always after the user row)
    pub(crate) async fn lock_code(
        conn: &mut PgConnection,
        code: &str,
    ) -> CreditResult<Option<LtdCode>> {
        let code: Option<LtdCode> = sqlx::query_as(&format!(
            "SELECT {} FROM ltd_codes WHERE code = $1 FOR UPDATE",
            CODE_COLUMNS
        ))
        .bind(code)
        .fetch_optional(conn)
        .await?;
        Ok(code)
    }

    /// Read-only usability check
    pub async fn validate_code(&self, code: &str) -> CreditResult<CodeValidation> {
        let code = normalize_code(code)?;
        let Some(stored) = self.find_by_code(&code).await? else {
            return Ok(CodeValidation::defective(CodeDefect::NotFound));
        };

        Ok(match stored.defect_at(OffsetDateTime::now_utc()) {
            Some(defect) => CodeValidation::defective(defect),
            None => CodeValidation::usable(stored.ltd_tier()?),
        })
    }

    /// Deactivate every active code whose expiry has passed. Idempotent.
    pub async fn sweep_expired(&self) -> CreditResult<Vec<LtdCode>> {
        let expired: Vec<LtdCode> = sqlx::query_as(&format!(
            r#"
            UPDATE ltd_codes
            SET is_active = FALSE, updated_at = NOW()
            WHERE is_active = TRUE
              AND expires_at IS NOT NULL
              AND expires_at <= NOW()
            RETURNING {}
            "#,
            CODE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "Deactivated expired codes");
        }
        Ok(expired)
    }

    /// Set `is_active` on every selected code. Audited.
    pub async fn set_active(
        &self,
        selector: CodeSelector,
        active: bool,
        admin_id: UserId,
    ) -> CreditResult<u64> {
        let action_type = if active {
            action::BULK_ACTIVATE
        } else {
            action::BULK_DEACTIVATE
        };
        let audit = AdminAction::new(admin_id, action_type).target(selector.describe());

        let result: CreditResult<u64> = async {
            selector.validate()?;
            let (batch, ids) = selector.binds();
            let affected = sqlx::query(
                r#"
                UPDATE ltd_codes SET is_active = $1, updated_at = NOW()
                WHERE (($2::text IS NOT NULL AND batch_id = $2)
                    OR ($3::bigint[] IS NOT NULL AND id = ANY($3)))
                  AND is_active <> $1
                "#,
            )
            .bind(active)
            .bind(batch)
            .bind(ids)
            .execute(&self.pool)
            .await?
            .rows_affected();
            Ok(affected)
        }
        .await;

        let audit = match &result {
            Ok(affected) => audit.details(serde_json::json!({ "affected": affected })),
            Err(_) => audit,
        };
        self.audit.record_attempt(audit, result).await
    }

    /// Delete selected codes that were never redeemed. Redeemed codes are
    /// always left in place. Audited.
    pub async fn delete_unredeemed(
        &self,
        selector: CodeSelector,
        admin_id: UserId,
    ) -> CreditResult<Vec<LtdCode>> {
        let audit =
            AdminAction::new(admin_id, action::BULK_DELETE_UNREDEEMED).target(selector.describe());

        let result: CreditResult<Vec<LtdCode>> = async {
            selector.validate()?;
            let (batch, ids) = selector.binds();
            let deleted: Vec<LtdCode> = sqlx::query_as(&format!(
                r#"
                DELETE FROM ltd_codes
                WHERE (($1::text IS NOT NULL AND batch_id = $1)
                    OR ($2::bigint[] IS NOT NULL AND id = ANY($2)))
                  AND current_redemptions = 0
                  AND NOT EXISTS (SELECT 1 FROM ltd_redemptions r WHERE r.code_id = ltd_codes.id)
                RETURNING {}
                "#,
                CODE_COLUMNS
            ))
            .bind(batch)
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;
            Ok(deleted)
        }
        .await;

        let audit = match &result {
            Ok(deleted) => audit.details(serde_json::json!({ "deleted": deleted.len() })),
            Err(_) => audit,
        };
        self.audit.record_attempt(audit, result).await
    }

    pub async fn get_code(&self, id: i64) -> CreditResult<Option<LtdCode>> {
        let code: Option<LtdCode> = sqlx::query_as(&format!(
            "SELECT {} FROM ltd_codes WHERE id = $1",
            CODE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(code)
    }

    /// Edit a code. `max_redemptions` may not drop below redemptions already made. Audited.
    pub async fn update_code(
        &self,
        id: i64,
        changes: CodeUpdate,
        admin_id: UserId,
    ) -> CreditResult<LtdCode> {
        let audit = AdminAction::new(admin_id, action::UPDATE_CODE)
            .target(id.to_string())
            .details(serde_json::json!({
                "max_redemptions": changes.max_redemptions,
                "is_active": changes.is_active,
                "clear_expiry": changes.clear_expiry,
                "expires_at": changes.expires_at.map(|at| at.unix_timestamp()),
            }));

        let result: CreditResult<LtdCode> = async {
            if changes.is_empty() {
                return Err(CreditError::InvalidInput("No fields to update".into()));
            }
            if changes.max_redemptions.is_some_and(|m| m < 1) {
                return Err(CreditError::InvalidInput(
                    "max_redemptions must be at least 1".into(),
                ));
            }

            let updated: Option<LtdCode> = sqlx::query_as(&format!(
                r#"
                UPDATE ltd_codes SET
                    max_redemptions = COALESCE($2, max_redemptions),
                    expires_at = CASE WHEN $4 THEN NULL ELSE COALESCE($3, expires_at) END,
                    is_active = COALESCE($5, is_active),
                    notes = COALESCE($6, notes),
                    updated_at = NOW()
                WHERE id = $1
                  AND ($2::int IS NULL OR $2 >= current_redemptions)
                RETURNING {}
                "#,
                CODE_COLUMNS
            ))
            .bind(id)
            .bind(changes.max_redemptions)
            .bind(changes.expires_at)
            .bind(changes.clear_expiry)
            .bind(changes.is_active)
            .bind(&changes.notes)
            .fetch_optional(&self.pool)
            .await?;

            match updated {
                Some(code) => Ok(code),
                None => match self.get_code(id).await? {
                    None => Err(CreditError::NotFound(format!("code {}", id))),
                    Some(existing) => Err(CreditError::IntegrityViolation(format!(
                        "max_redemptions cannot drop below {} existing redemptions",
                        existing.current_redemptions
                    ))),
                },
            }
        }
        .await;

        self.audit.record_attempt(audit, result).await
    }

    /// Delete one code; refuses codes that have been redeemed. Audited.
    pub async fn delete_code(&self, id: i64, admin_id: UserId) -> CreditResult<()> {
        let audit = AdminAction::new(admin_id, action::DELETE_CODE).target(id.to_string());

        let result: CreditResult<()> = async {
            let deleted = sqlx::query(
                r#"
                DELETE FROM ltd_codes
                WHERE id = $1
                  AND current_redemptions = 0
                  AND NOT EXISTS (SELECT 1 FROM ltd_redemptions r WHERE r.code_id = ltd_codes.id)
                "#,
            )
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();

            if deleted > 0 {
                return Ok(());
            }
            match self.get_code(id).await? {
                None => Err(CreditError::NotFound(format!("code {}", id))),
                Some(_) => Err(CreditError::IntegrityViolation(
                    "redeemed codes cannot be deleted".into(),
                )),
            }
        }
        .await;

        self.audit.record_attempt(audit, result).await
    }

    pub async fn list_codes(&self, filter: &CodeFilter) -> CreditResult<CodePage> {
        let page = filter.page.unwrap_or(1);
        let limit = filter.limit.unwrap_or(50);
        if page < 1 {
            return Err(CreditError::InvalidInput("page must be >= 1".into()));
        }
        if !(1..=500).contains(&limit) {
            return Err(CreditError::InvalidInput(
                "limit must be between 1 and 500".into(),
            ));
        }
        let offset = (page - 1).saturating_mul(limit);
        let status = filter.status.map(|s| s.as_str());
        let search = filter.search.as_deref().map(str::trim).filter(|s| !s.is_empty());

        const WHERE_CLAUSE: &str = r#"
            WHERE ($1::int IS NULL OR tier = $1)
              AND ($2::text IS NULL
                OR ($2 = 'active' AND is_active = TRUE
                    AND (expires_at IS NULL OR expires_at > NOW())
                    AND current_redemptions < max_redemptions)
                OR ($2 = 'expired' AND expires_at IS NOT NULL AND expires_at <= NOW())
                OR ($2 = 'redeemed' AND current_redemptions >= max_redemptions)
                OR ($2 = 'disabled' AND is_active = FALSE))
              AND ($3::text IS NULL OR batch_id = $3)
              AND ($4::text IS NULL OR code ILIKE '%' || $4 || '%' OR notes ILIKE '%' || $4 || '%')
        "#;

        let total: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM ltd_codes {}",
            WHERE_CLAUSE
        ))
        .bind(filter.tier)
        .bind(status)
        .bind(&filter.batch_id)
        .bind(search)
        .fetch_one(&self.pool)
        .await?;

        let codes: Vec<LtdCode> = sqlx::query_as(&format!(
            "SELECT {} FROM ltd_codes {} ORDER BY created_at DESC, id DESC LIMIT $5 OFFSET $6",
            CODE_COLUMNS, WHERE_CLAUSE
        ))
        .bind(filter.tier)
        .bind(status)
        .bind(&filter.batch_id)
        .bind(search)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(CodePage {
            codes,
            total,
            page,
            total_pages: (total + limit - 1) / limit,
        })
    }

    pub async fn code_statistics(&self) -> CreditResult<CodeStatistics> {
        let stats: CodeStatistics = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) AS total_codes,
                COUNT(*) FILTER (WHERE is_active = TRUE) AS active_codes,
                COUNT(*) FILTER (WHERE current_redemptions > 0) AS redeemed_codes,
                COUNT(*) FILTER (WHERE current_redemptions >= max_redemptions) AS fully_redeemed,
                COUNT(*) FILTER (
                    WHERE expires_at IS NOT NULL AND expires_at <= NOW()
                ) AS expired_codes,
                COALESCE(SUM(current_redemptions), 0)::bigint AS total_redemptions,
                COUNT(*) FILTER (WHERE tier = 1) AS tier1_codes,
                COUNT(*) FILTER (WHERE tier = 2) AS tier2_codes,
                COUNT(*) FILTER (WHERE tier = 3) AS tier3_codes,
                COUNT(*) FILTER (WHERE tier = 4) AS tier4_codes
            FROM ltd_codes
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(stats)
    }

    /// Usable codes expiring within `days_ahead` days
    pub async fn expiring_codes(&self, days_ahead: i64) -> CreditResult<Vec<LtdCode>> {
        if !(1..=365).contains(&days_ahead) {
            return Err(CreditError::InvalidInput(
                "days_ahead must be between 1 and 365".into(),
            ));
        }
        let horizon = OffsetDateTime::now_utc() + Duration::days(days_ahead);

        let codes: Vec<LtdCode> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM ltd_codes
            WHERE is_active = TRUE
              AND current_redemptions < max_redemptions
              AND expires_at IS NOT NULL
              AND expires_at > NOW()
              AND expires_at <= $1
            ORDER BY expires_at ASC
            "#,
            CODE_COLUMNS
        ))
        .bind(horizon)
        .fetch_all(&self.pool)
        .await?;
        Ok(codes)
    }

    /// Every code matching `filter`, ignoring pagination (CSV export)
    pub async fn all_codes(&self, filter: &CodeFilter) -> CreditResult<Vec<LtdCode>> {
        let mut all = Vec::new();
        let mut page = 1;
        loop {
            let batch = self
                .list_codes(&CodeFilter {
                    page: Some(page),
                    limit: Some(500),
                    ..filter.clone()
                })
                .await?;
            let done = page >= batch.total_pages;
            all.extend(batch.codes);
            if done {
                return Ok(all);
            }
            page += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn code(
        is_active: bool,
        current: i32,
        max: i32,
        expires_at: Option<OffsetDateTime>,
    ) -> LtdCode {
        let created = datetime!(2025-01-01 00:00 UTC);
        LtdCode {
            id: 1,
            code: "LTD-T2-ABCD-1234".into(),
            tier: 2,
            batch_id: "BATCH-1-00000000".into(),
            max_redemptions: max,
            current_redemptions: current,
            expires_at,
            is_active,
            notes: None,
            created_by_admin_id: None,
            created_at: created,
            updated_at: created,
        }
    }

    const NOW: OffsetDateTime = datetime!(2025-06-01 12:00 UTC);

    #[test]
    fn test_usable_code_has_no_defect() {
        assert_eq!(code(true, 0, 1, None).defect_at(NOW), None);
        assert_eq!(
            code(true, 2, 3, Some(datetime!(2025-06-02 00:00 UTC))).defect_at(NOW),
            None
        );
    }

    #[test]
    fn test_inactive_code_is_disabled() {
        assert_eq!(
            code(false, 0, 1, None).defect_at(NOW),
            Some(CodeDefect::Disabled)
        );
    }

    #[test]
    fn test_expiry_is_inclusive() {
        assert_eq!(
            code(true, 0, 1, Some(NOW)).defect_at(NOW),
            Some(CodeDefect::Expired)
        );
    }

    #[test]
    fn test_exhausted_code() {
        assert_eq!(
            code(true, 1, 1, None).defect_at(NOW),
            Some(CodeDefect::Exhausted)
        );
    }

    #[test]
    fn test_normalize_code() {
        assert_eq!(
            normalize_code("  ltd-t2-abcd-1234 ").unwrap(),
            "LTD-T2-ABCD-1234"
        );
        assert!(normalize_code("   ").is_err());
        assert!(normalize_code("LTD T2").is_err());
        assert!(normalize_code("CODE;DROP").is_err());
        assert!(normalize_code(&"A".repeat(65)).is_err());
    }

    #[test]
    fn test_format_code_groups_hex() {
        assert_eq!(
            format_code("LTD-T3-", [0xde, 0xad, 0xbe, 0xef]),
            "LTD-T3-DEAD-BEEF"
        );
    }

    #[test]
    fn test_format_batch_id() {
        let id = format_batch_id(datetime!(1970-01-01 00:00:01 UTC), [0x0a, 0x0b, 0x0c, 0x0d]);
        assert_eq!(id, "BATCH-1000-0a0b0c0d");
    }

    #[test]
    fn test_default_prefix_and_custom_prefix() {
        let tier = LtdTier::new(2).unwrap();
        assert_eq!(validated_prefix(None, tier).unwrap(), "LTD-T2-");
        assert_eq!(validated_prefix(Some(" bf24-"), tier).unwrap(), "BF24-");
        assert!(validated_prefix(Some(&"X".repeat(60)), tier).is_err());
    }

    fn request(tier: i32, quantity: u32) -> GenerateCodesRequest {
        GenerateCodesRequest {
            tier,
            quantity,
            prefix: None,
            max_redemptions: None,
            expires_at: None,
            notes: Some("  ".into()),
        }
    }

    #[test]
    fn test_generation_plan_defaults() {
        let plan = GenerationPlan::from_request(&request(4, 10), NOW).unwrap();
        assert_eq!(plan.max_redemptions, 1);
        assert_eq!(plan.prefix, "LTD-T4-");
        assert_eq!(plan.notes, None);
    }

    #[test]
    fn test_generation_rejects_bad_tier_and_quantity() {
        assert!(GenerationPlan::from_request(&request(5, 1), NOW).is_err());
        assert!(GenerationPlan::from_request(&request(0, 1), NOW).is_err());
        assert!(GenerationPlan::from_request(&request(1, 0), NOW).is_err());
        let too_many = request(1, 1001);
        assert!(GenerationPlan::from_request(&too_many, NOW).is_err());
        assert!(GenerationPlan::from_request(&request(1, 1000), NOW).is_ok());
    }

    #[test]
    fn test_generation_rejects_past_expiry_and_zero_limit() {
        let mut req = request(1, 1);
        req.expires_at = Some(datetime!(2025-05-01 00:00 UTC));
        assert!(GenerationPlan::from_request(&req, NOW).is_err());

        let mut req = request(1, 1);
        req.max_redemptions = Some(0);
        assert!(GenerationPlan::from_request(&req, NOW).is_err());
    }

    #[test]
    fn test_empty_selector_is_rejected() {
        assert!(CodeSelector::Ids(vec![]).validate().is_err());
        assert!(CodeSelector::Batch(" ".into()).validate().is_err());
        assert!(CodeSelector::Ids(vec![7]).validate().is_ok());
    }

    #[test]
    fn test_validation_serializes_reason() {
        let json = serde_json::to_value(CodeValidation::defective(CodeDefect::Expired)).unwrap();
        assert_eq!(json["valid"], false);
        assert_eq!(json["reason"], "CODE_INVALID");
        assert_eq!(json["defect"], "expired");
    }
}
