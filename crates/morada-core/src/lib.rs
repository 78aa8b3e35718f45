//! Core domain model for Morada.

use chrono::{DateTime, FixedOffset};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const CRATE_NAME: &str = "morada-core";

/// Listings carry wall-clock timestamps in Brasília time (UTC-3).
pub fn brasilia_offset() -> FixedOffset {
    FixedOffset::west_opt(3 * 3600).expect("static offset is in range")
}

/// Source portal a listing was observed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Platform {
    #[serde(rename = "imovelweb")]
    ImovelWeb,
    #[serde(rename = "zap_imoveis")]
    ZapImoveis,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::ImovelWeb => "imovelweb",
            Platform::ZapImoveis => "zap_imoveis",
        }
    }

    pub const ALL: [Platform; 2] = [Platform::ImovelWeb, Platform::ZapImoveis];
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown platform `{0}`")]
pub struct UnknownPlatform(String);

impl FromStr for Platform {
    type Err = UnknownPlatform;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "imovelweb" => Ok(Platform::ImovelWeb),
            "zap_imoveis" => Ok(Platform::ZapImoveis),
            other => Err(UnknownPlatform(other.to_string())),
        }
    }
}

/// One listing as parsed out of a results page. Transient: produced by an
/// adapter, handed to the sink, dropped.
///
/// `(platform, platform_code)` identifies the same real-world listing across
/// repeated scrapes. Optional fields are `None` when the card omits them;
/// absence is not zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingRecord {
    pub platform: Platform,
    /// Portal-assigned listing identifier, unique within the platform.
    pub platform_code: String,
    /// Never empty; adapters substitute a placeholder when the card has no
    /// description text.
    pub description: String,
    pub price: Option<Decimal>,
    pub condo_fee: Option<Decimal>,
    pub location: Option<String>,
    pub address: Option<String>,
    pub url: Option<String>,
    pub area: Option<Decimal>,
    pub rooms: Option<Decimal>,
    pub bathrooms: Option<Decimal>,
    pub scraped_at: DateTime<FixedOffset>,
}

/// Persisted shape: one row per `(platform, platform_code)` ever observed,
/// updated in place on repeat sightings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredListing {
    pub id: i64,
    pub platform: Platform,
    pub platform_code: String,
    pub description: String,
    pub price: Option<Decimal>,
    pub condo_fee: Option<Decimal>,
    pub location: Option<String>,
    pub address: Option<String>,
    pub url: Option<String>,
    pub area: Option<Decimal>,
    pub rooms: Option<Decimal>,
    pub bathrooms: Option<Decimal>,
    pub scraped_at: DateTime<FixedOffset>,
}

impl StoredListing {
    pub fn from_record(id: i64, record: &ListingRecord) -> Self {
        Self {
            id,
            platform: record.platform,
            platform_code: record.platform_code.clone(),
            description: record.description.clone(),
            price: record.price,
            condo_fee: record.condo_fee,
            location: record.location.clone(),
            address: record.address.clone(),
            url: record.url.clone(),
            area: record.area,
            rooms: record.rooms,
            bathrooms: record.bathrooms,
            scraped_at: record.scraped_at,
        }
    }

    /// Field-level merge: a present value on the new sighting overwrites the
    /// stored one, an absent value leaves it alone. Description and
    /// `scraped_at` are always present and always refreshed.
    pub fn merge_from(&mut self, record: &ListingRecord) {
        debug_assert_eq!(self.platform, record.platform);
        debug_assert_eq!(self.platform_code, record.platform_code);

        self.description = record.description.clone();
        self.scraped_at = record.scraped_at;

        if record.price.is_some() {
            self.price = record.price;
        }
        if record.condo_fee.is_some() {
            self.condo_fee = record.condo_fee;
        }
        if let Some(location) = &record.location {
            self.location = Some(location.clone());
        }
        if let Some(address) = &record.address {
            self.address = Some(address.clone());
        }
        if let Some(url) = &record.url {
            self.url = Some(url.clone());
        }
        if record.area.is_some() {
            self.area = record.area;
        }
        if record.rooms.is_some() {
            self.rooms = record.rooms;
        }
        if record.bathrooms.is_some() {
            self.bathrooms = record.bathrooms;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn record(price: Option<&str>, rooms: Option<&str>) -> ListingRecord {
        ListingRecord {
            platform: Platform::ImovelWeb,
            platform_code: "abc-123".into(),
            description: "Apartamento na Trindade".into(),
            price: price.map(|p| Decimal::from_str(p).unwrap()),
            condo_fee: None,
            location: Some("Trindade, Florianópolis".into()),
            address: None,
            url: Some("https://www.imovelweb.com.br/propriedades/abc-123".into()),
            area: None,
            rooms: rooms.map(|r| Decimal::from_str(r).unwrap()),
            bathrooms: None,
            scraped_at: brasilia_offset()
                .with_ymd_and_hms(2025, 1, 1, 12, 0, 0)
                .single()
                .unwrap(),
        }
    }

    #[test]
    fn merge_keeps_stored_value_when_new_field_is_absent() {
        let mut stored = StoredListing::from_record(1, &record(Some("350000.50"), Some("2")));
        stored.merge_from(&record(None, Some("3")));

        assert_eq!(stored.price, Some(Decimal::from_str("350000.50").unwrap()));
        assert_eq!(stored.rooms, Some(Decimal::from_str("3").unwrap()));
    }

    #[test]
    fn merge_overwrites_with_present_values() {
        let mut stored = StoredListing::from_record(1, &record(Some("350000.50"), None));
        stored.merge_from(&record(Some("349000"), Some("2")));

        assert_eq!(stored.price, Some(Decimal::from_str("349000").unwrap()));
        assert_eq!(stored.rooms, Some(Decimal::from_str("2").unwrap()));
    }

    #[test]
    fn platform_round_trips_through_str() {
        for platform in Platform::ALL {
            assert_eq!(Platform::from_str(platform.as_str()).unwrap(), platform);
        }
        assert!(Platform::from_str("olx").is_err());
    }
}
