//! CSV export of codes and LTD users.
//!
//! Every cell is quoted so codes and notes survive spreadsheet imports intact.

use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::OffsetDateTime;

use crate::admin::LtdUserSummary;
use crate::codes::LtdCode;
use crate::error::{CreditError, CreditResult};

const CODE_HEADER: [&str; 8] = [
    "Code",
    "Tier",
    "Max Uses",
    "Redeemed",
    "Expires At",
    "Status",
    "Batch ID",
    "Notes",
];

const USER_HEADER: [&str; 8] = [
    "User ID",
    "Email",
    "Name",
    "Tier",
    "Credits",
    "Monthly Limit",
    "Codes Redeemed",
    "Joined At",
];

/// Quote a CSV cell, doubling embedded quotes
fn escape_csv_field(field: &str) -> String {
    format!("\"{}\"", field.replace('"', "\"\""))
}

fn push_row<I, S>(csv: &mut String, cells: I)
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let row: Vec<String> = cells
        .into_iter()
        .map(|cell| escape_csv_field(cell.as_ref()))
        .collect();
    csv.push_str(&row.join(","));
    csv.push('\n');
}

fn format_date(at: OffsetDateTime) -> CreditResult<String> {
    at.format(format_description!("[year]-[month]-[day]"))
        .map_err(|e| CreditError::Internal(format!("date formatting failed: {}", e)))
}

pub fn codes_csv(codes: &[LtdCode]) -> CreditResult<String> {
    let mut csv = String::new();
    push_row(&mut csv, CODE_HEADER);

    for code in codes {
        let expires = match code.expires_at {
            Some(at) => format_date(at)?,
            None => "Never".to_string(),
        };
        let status = if code.is_active { "Active" } else { "Disabled" };
        push_row(
            &mut csv,
            [
                code.code.clone(),
                code.tier.to_string(),
                code.max_redemptions.to_string(),
                code.current_redemptions.to_string(),
                expires,
                status.to_string(),
                code.batch_id.clone(),
                code.notes.clone().unwrap_or_default(),
            ],
        );
    }
    Ok(csv)
}

pub fn users_csv(users: &[LtdUserSummary]) -> CreditResult<String> {
    let mut csv = String::new();
    push_row(&mut csv, USER_HEADER);

    for user in users {
        let joined = user
            .created_at
            .format(&Rfc3339)
            .map_err(|e| CreditError::Internal(format!("date formatting failed: {}", e)))?;
        push_row(
            &mut csv,
            [
                user.id.to_string(),
                user.email.clone(),
                user.name.clone().unwrap_or_default(),
                user.ltd_tier.map(|t| t.to_string()).unwrap_or_default(),
                user.credits.to_string(),
                user.monthly_credit_limit.to_string(),
                user.redemption_count.to_string(),
                joined,
            ],
        );
    }
    Ok(csv)
}
