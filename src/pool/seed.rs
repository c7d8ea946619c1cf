//! Seed loaders for the location CSV and the email list.

use std::path::Path;

use tracing::{info, warn};

use super::{EmailPool, LocationPool};
use crate::models::resource::{EmailAddress, Location};
use crate::{AppError, Result};

const LOCATION_COLUMNS: [&str; 5] = ["city", "state", "lat", "lon", "countrycode"];

/// Parse location rows from CSV text.
///
/// The header must name `city`, `state`, `lat`, `lon`, and `countryCode`
/// (any order, case-insensitive); extra columns are ignored. Rows with a
/// missing field, or a coordinate that is not a finite number inside
/// ±90 latitude and ±180 longitude, are skipped with a warning.
///
/// # Errors
///
/// Returns `AppError::Config` if the header lacks a required column.
pub fn parse_locations_csv(text: &str) -> Result<Vec<Location>> {
    let mut lines = text
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty());

    let Some((_, header)) = lines.next() else {
        return Ok(Vec::new());
    };
    let header: Vec<String> = split_csv_line(header)
        .into_iter()
        .map(|h| h.to_lowercase())
        .collect();

    let mut index = [0_usize; 5];
    for (slot, column) in index.iter_mut().zip(LOCATION_COLUMNS) {
        *slot = header
            .iter()
            .position(|h| h == column)
            .ok_or_else(|| AppError::Config(format!("locations csv is missing column '{column}'")))?;
    }

    let mut out = Vec::new();
    for (line_no, line) in lines {
        match parse_location_row(&split_csv_line(line), index) {
            Some(location) => out.push(location),
            None => warn!(line = line_no + 1, "skipping malformed location row"),
        }
    }
    Ok(out)
}

fn parse_location_row(fields: &[String], index: [usize; 5]) -> Option<Location> {
    let [city, state, lat, lon, country] = index;
    let field = |i: usize| fields.get(i).map(String::as_str).unwrap_or_default();
    Some(Location {
        city: non_empty(field(city))?,
        state: non_empty(field(state))?,
        lat: coordinate(field(lat), 90.0)?,
        lon: coordinate(field(lon), 180.0)?,
        country_code: non_empty(field(country))?,
    })
}

/// Finite value within `±limit` degrees.
fn coordinate(raw: &str, limit: f64) -> Option<f64> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && v.abs() <= limit)
}

fn non_empty(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_owned())
}

/// Split one CSV line, honoring double-quoted fields and `""` escapes.
fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match (c, quoted) {
            ('"', true) if chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            ('"', _) => quoted = !quoted,
            (',', false) => fields.push(std::mem::take(&mut current).trim().to_owned()),
            _ => current.push(c),
        }
    }
    fields.push(current.trim().to_owned());
    fields
}

/// Parse newline-delimited email addresses, skipping blanks and `#` comments.
#[must_use]
pub fn parse_email_lines(text: &str) -> Vec<EmailAddress> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(EmailAddress::new)
        .collect()
}

async fn read_seed(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path).await.map_err(|e| {
        AppError::Config(format!("failed to read seed file {}: {e}", path.display()))
    })
}

impl LocationPool {
    /// Load locations from a CSV file. Returns how many were new.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file is unreadable or its header is
    /// incomplete, or `AppError::Persistence` if saving fails.
    pub async fn load_locations_csv(&self, path: &Path) -> Result<usize> {
        let text = read_seed(path).await?;
        let locations = parse_locations_csv(&text)?;
        let parsed = locations.len();
        let added = self.add_items(locations).await?;
        info!(path = %path.display(), parsed, added, "locations loaded");
        Ok(added)
    }
}

impl EmailPool {
    /// Load addresses from a newline-delimited file. Returns how many were new.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file is unreadable, or
    /// `AppError::Persistence` if saving fails.
    pub async fn load_emails_file(&self, path: &Path) -> Result<usize> {
        let text = read_seed(path).await?;
        let emails = parse_email_lines(&text);
        let parsed = emails.len();
        let added = self.add_items(emails).await?;
        info!(path = %path.display(), parsed, added, "emails loaded");
        Ok(added)
    }
}
