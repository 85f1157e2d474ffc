use std::env;

use anyhow::Context;
use chrono::{FixedOffset, NaiveTime};

use crate::engine::calendar::{CalendarPolicy, parse_weekday};

#[derive(Clone, Debug)]
pub struct Config {
    /// Unset means the in-memory store.
    pub database_url: Option<String>,
    pub bind_addr: String,
    pub db_max_connections: u32,
    pub invoice_number_attempts: u32,
    pub policy: CalendarPolicy,
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn clock(key: &str, default: &str) -> anyhow::Result<NaiveTime> {
    let raw = env::var(key).unwrap_or_else(|_| default.to_string());
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .with_context(|| format!("{key} must be HH:MM, got {raw:?}"))
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = env::var("DATABASE_URL").ok().filter(|s| !s.trim().is_empty());
        let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
        let db_max_connections = parse_or("DB_MAX_CONNECTIONS", 10u32);
        let invoice_number_attempts = parse_or("INVOICE_NUMBER_ATTEMPTS", 5u32).max(1);

        let open = clock("CLINIC_OPEN", "09:00")?;
        let close = clock("CLINIC_CLOSE", "21:00")?;
        let slot_minutes = parse_or("SLOT_MINUTES", 30u32);
        let closed_raw = env::var("CLOSED_WEEKDAY").unwrap_or_else(|_| "fri".to_string());
        let closed_weekday = parse_weekday(&closed_raw)?;
        let offset_minutes = parse_or("CLINIC_UTC_OFFSET_MINUTES", 180i32);
        let utc_offset = FixedOffset::east_opt(offset_minutes * 60)
            .with_context(|| format!("CLINIC_UTC_OFFSET_MINUTES out of range: {offset_minutes}"))?;

        let policy = CalendarPolicy::new(open, close, slot_minutes, closed_weekday, utc_offset)?;

        Ok(Self {
            database_url,
            bind_addr,
            db_max_connections,
            invoice_number_attempts,
            policy,
        })
    }
}
