//! Parse captured results pages end to end, one fixture per portal.

use std::path::PathBuf;
use std::str::FromStr;

use morada_adapters::{ImovelWebAdapter, SourceAdapter, ZapImoveisAdapter, NO_DESCRIPTION};
use morada_core::Platform;
use rust_decimal::Decimal;

fn fixture(name: &str) -> String {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name);
    std::fs::read_to_string(&path).unwrap_or_else(|err| panic!("reading {name}: {err}"))
}

fn dec(value: &str) -> Decimal {
    Decimal::from_str(value).unwrap()
}

#[test]
fn imovelweb_results_page_parses_every_card() {
    let adapter = ImovelWebAdapter::new();
    let listings = adapter.parse_page(&fixture("imovelweb_results.html"));

    assert_eq!(listings.len(), 3);
    for listing in &listings {
        assert_eq!(listing.platform, Platform::ImovelWeb);
        assert!(!listing.platform_code.is_empty());
        assert!(listing
            .url
            .as_deref()
            .unwrap()
            .starts_with("https://www.imovelweb.com.br/propriedades/"));
        assert!(!listing.description.is_empty());
    }

    let first = &listings[0];
    assert_eq!(first.platform_code, "2998744521");
    assert_eq!(first.price, Some(dec("489000")));
    assert_eq!(first.condo_fee, Some(dec("620")));
    assert_eq!(first.location.as_deref(), Some("Trindade, Florianópolis"));
    assert_eq!(first.address.as_deref(), Some("Rua Lauro Linhares, 1060"));
    assert_eq!(first.area, Some(dec("68")));
    assert_eq!(first.rooms, Some(dec("2")));
    assert_eq!(first.bathrooms, Some(dec("2")));
    assert_eq!(
        first.description,
        "Apartamento reformado a duas quadras da UFSC, sol da manhã."
    );

    let second = &listings[1];
    assert_eq!(second.price, Some(dec("735500.50")));
    assert_eq!(second.condo_fee, None);
    assert_eq!(second.address, None);
    assert_eq!(second.description, NO_DESCRIPTION);

    let third = &listings[2];
    assert_eq!(third.price, None);
    assert_eq!(third.bathrooms, None);
}

#[test]
fn zap_results_page_skips_cards_without_a_listing_anchor() {
    let adapter = ZapImoveisAdapter::new();
    let listings = adapter.parse_page(&fixture("zap_results.html"));

    // Position 2 is an ad slot with no listing anchor.
    assert_eq!(listings.len(), 2);

    let first = &listings[0];
    assert_eq!(first.platform, Platform::ZapImoveis);
    assert_eq!(first.platform_code, "1063208471");
    assert_eq!(first.price, Some(dec("560000")));
    assert_eq!(first.condo_fee, Some(dec("1150")));
    assert_eq!(
        first.location.as_deref(),
        Some("Córrego Grande, Florianópolis")
    );
    assert_eq!(first.address.as_deref(), Some("Rua João Pio Duarte Silva"));
    assert_eq!(first.area, Some(dec("80")));
    assert_eq!(first.rooms, Some(dec("3")));
    assert_eq!(first.bathrooms, Some(dec("2")));
    assert_eq!(first.description, "80 m², 3 quartos, 2 banheiros");

    let second = &listings[1];
    assert_eq!(second.platform_code, "1063215927");
    assert_eq!(second.price, Some(dec("398000")));
    assert_eq!(second.condo_fee, None);
    assert_eq!(second.area, None);
    assert_eq!(second.rooms, Some(dec("2")));
    assert_eq!(second.description, NO_DESCRIPTION);
}
