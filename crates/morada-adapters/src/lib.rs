//! Source adapter contracts, field extraction, and challenge handling for the
//! two housing portals Morada tracks.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use morada_browser::{BrowserError, PageDriver};
use morada_core::{brasilia_offset, ListingRecord, Platform};
use regex::Regex;
use rust_decimal::Decimal;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "morada-adapters";

/// Substituted when a card carries no description text.
pub const NO_DESCRIPTION: &str = "No description available.";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Browser(#[from] BrowserError),
}

/// One portal's scrape surface. `page_urls` is infinite on purpose: the end
/// of the result set is only discoverable by fetching.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    fn page_urls(&self) -> Box<dyn Iterator<Item = String> + Send>;

    /// Rendered markup for one results page, or `None` once the portal
    /// reports no more results (or the challenge budget runs out).
    async fn fetch_page(
        &self,
        page: &dyn PageDriver,
        url: &str,
    ) -> Result<Option<String>, AdapterError>;

    /// Card-by-card extraction. A card that cannot yield a natural key is
    /// skipped; a missing field never aborts the rest of the page.
    fn parse_page(&self, html: &str) -> Vec<ListingRecord>;
}

fn static_selector(source: &str) -> Selector {
    Selector::parse(source).expect("static selector is well-formed")
}

fn static_regex(source: &str) -> Regex {
    Regex::new(source).expect("static pattern is well-formed")
}

// ---------------------------------------------------------------------------
// Field extraction
// ---------------------------------------------------------------------------

/// Collapse internal whitespace runs to single spaces and trim the ends.
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalized text content of an element, `None` when effectively empty.
pub fn element_text(element: ElementRef<'_>) -> Option<String> {
    let text = collapse_whitespace(&element.text().collect::<String>());
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Normalized text of the first descendant matching `selector`.
pub fn select_text(card: ElementRef<'_>, selector: &Selector) -> Option<String> {
    card.select(selector).next().and_then(element_text)
}

/// Attribute value of the first descendant matching `selector`.
pub fn select_attr(card: ElementRef<'_>, selector: &Selector, attr: &str) -> Option<String> {
    card.select(selector)
        .next()
        .and_then(|element| element.value().attr(attr))
        .map(str::to_string)
}

/// Find the first `tag` descendant whose text matches `pattern`, run the
/// first capture through `transform`, and parse it into `T`. Absent or
/// malformed values resolve to `default`.
pub fn extract_numeric<T>(
    card: ElementRef<'_>,
    tag: &Selector,
    pattern: &Regex,
    transform: impl Fn(&str) -> String,
    default: Option<T>,
) -> Option<T>
where
    T: std::str::FromStr,
{
    for element in card.select(tag) {
        let text = element.text().collect::<String>();
        if let Some(captures) = pattern.captures(&text) {
            if let Some(raw) = captures.get(1) {
                return transform(raw.as_str()).parse().ok().or(default);
            }
        }
    }
    default
}

/// First run of digits inside the first descendant matching `selector`
/// (the selector carries the structured attribute, e.g. a `data-cy` value).
pub fn extract_digits(card: ElementRef<'_>, selector: &Selector, digits: &Regex) -> Option<Decimal> {
    let text = select_text(card, selector)?;
    let captures = digits.captures(&text)?;
    captures.get(1)?.as_str().parse().ok()
}

/// Parse a Brazilian currency string losslessly: strip the `R$` symbol and
/// thousands dots, turn the decimal comma into a point.
/// `"R$ 350.000,50"` → `350000.50`.
pub fn parse_currency_brl(text: &str) -> Option<Decimal> {
    let normalized = text.replace("R$", "").replace('.', "").replace(',', ".");
    normalized.trim().parse().ok()
}

// ---------------------------------------------------------------------------
// Challenge (anti-bot interstitial) handling
// ---------------------------------------------------------------------------

/// The interstitial widget is rendered too small to click until resized.
const WIDGET_RESIZE_SCRIPT: &str =
    "function() { this.style.width = '300px'; this.style.height = '65px'; }";

#[derive(Debug, Clone)]
pub struct ChallengePolicy {
    /// Phrases that mark a challenge interstitial in the rendered title/body.
    pub markers: Vec<String>,
    /// Fixed structural path of the interactive verification widget.
    pub widget_selector: String,
    pub max_attempts: usize,
    pub wait: Duration,
}

impl Default for ChallengePolicy {
    fn default() -> Self {
        Self {
            markers: vec![
                "Verify you are human".to_string(),
                "Just a moment".to_string(),
            ],
            widget_selector: "body > div:nth-of-type(1) > div > div:nth-of-type(1) > div > div"
                .to_string(),
            max_attempts: 5,
            wait: Duration::from_secs(5),
        }
    }
}

impl ChallengePolicy {
    pub fn is_challenge(&self, html: &str) -> bool {
        self.markers.iter().any(|marker| html.contains(marker))
    }
}

/// Navigate to `url` and return its rendered content once no challenge
/// marker remains. Each attempt waits out the interstitial and, if it is
/// still up, resizes and clicks the verification widget. `None` when the
/// attempt budget is exhausted while still challenged.
pub async fn fetch_past_challenge(
    page: &dyn PageDriver,
    url: &str,
    policy: &ChallengePolicy,
) -> Result<Option<String>, AdapterError> {
    page.navigate(url).await?;
    page.wait_for_load().await?;

    let content = page.content().await?;
    if !policy.is_challenge(&content) {
        return Ok(Some(content));
    }

    for attempt in 1..=policy.max_attempts {
        info!(attempt, max = policy.max_attempts, "challenge page detected, waiting");
        tokio::time::sleep(policy.wait).await;

        let content = page.content().await?;
        if !policy.is_challenge(&content) {
            return Ok(Some(content));
        }

        match page
            .run_script_on(&policy.widget_selector, WIDGET_RESIZE_SCRIPT)
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(attempt, "challenge widget not found for resize"),
            Err(err) => warn!(attempt, error = %err, "challenge widget resize failed"),
        }
        match page.click(&policy.widget_selector).await {
            Ok(true) => {}
            Ok(false) => warn!(attempt, "challenge widget not found for click"),
            Err(err) => warn!(attempt, error = %err, "challenge widget click failed"),
        }
    }

    warn!(url, "challenge retry budget exhausted");
    Ok(None)
}

// ---------------------------------------------------------------------------
// ImovelWeb
// ---------------------------------------------------------------------------

const IMOVELWEB_BASE: &str = "https://www.imovelweb.com.br";
const IMOVELWEB_SEARCH: &str = "https://www.imovelweb.com.br/apartamentos-venda-trindade-florianopolis-itacorubi-corrego-grande-carvoeira-pantanal-florianopolis-santa-monica-florianopolis-coqueiros-florianopolis-estreito-florianopolis-abraao-capoeiras-florianopolis-kobrasol-campinas-sao-jose-desde-2-ate-3-quartos-200000-1000000-reales";
const IMOVELWEB_NO_RESULTS: &str =
    "Neste momento não temos imóveis com o perfil que está procurando";

struct ImovelWebSelectors {
    card: Selector,
    layout: Selector,
    price: Selector,
    location: Selector,
    address: Selector,
    description: Selector,
    div: Selector,
    span: Selector,
    condo_fee: Regex,
    area: Regex,
    rooms: Regex,
    bathrooms: Regex,
}

impl ImovelWebSelectors {
    fn new() -> Self {
        Self {
            card: static_selector("div.postingsList-module__card-container"),
            layout: static_selector("div.postingCardLayout-module__posting-card-layout"),
            price: static_selector(r#"div[data-qa="POSTING_CARD_PRICE"]"#),
            location: static_selector(r#"h2[data-qa="POSTING_CARD_LOCATION"]"#),
            address: static_selector("div.postingLocations-module__location-address-in-listing"),
            description: static_selector(r#"h3[data-qa="POSTING_CARD_DESCRIPTION"]"#),
            div: static_selector("div"),
            span: static_selector("span"),
            condo_fee: static_regex(r"([\d\.]+) Condominio"),
            area: static_regex(r"(\d+) m²"),
            rooms: static_regex(r"(\d+) quartos"),
            bathrooms: static_regex(r"(\d+) ban"),
        }
    }
}

/// Full results page per navigation; no lazy rendering.
pub struct ImovelWebAdapter {
    challenge: ChallengePolicy,
    sel: ImovelWebSelectors,
}

impl ImovelWebAdapter {
    pub fn new() -> Self {
        Self {
            challenge: ChallengePolicy::default(),
            sel: ImovelWebSelectors::new(),
        }
    }

    pub fn with_challenge_policy(mut self, policy: ChallengePolicy) -> Self {
        self.challenge = policy;
        self
    }
}

impl Default for ImovelWebAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceAdapter for ImovelWebAdapter {
    fn platform(&self) -> Platform {
        Platform::ImovelWeb
    }

    fn page_urls(&self) -> Box<dyn Iterator<Item = String> + Send> {
        Box::new((1u32..).map(|page| format!("{IMOVELWEB_SEARCH}-pagina-{page}.html")))
    }

    async fn fetch_page(
        &self,
        page: &dyn PageDriver,
        url: &str,
    ) -> Result<Option<String>, AdapterError> {
        // Challenge detection runs first; only clean content is checked for
        // the end-of-results marker.
        let Some(content) = fetch_past_challenge(page, url, &self.challenge).await? else {
            return Ok(None);
        };
        if content.contains(IMOVELWEB_NO_RESULTS) {
            info!(url, "no more results");
            return Ok(None);
        }
        Ok(Some(content))
    }

    fn parse_page(&self, html: &str) -> Vec<ListingRecord> {
        let document = Html::parse_document(html);
        let scraped_at = Utc::now().with_timezone(&brasilia_offset());
        let mut listings = Vec::new();

        for card in document.select(&self.sel.card) {
            let Some(platform_code) = select_attr(card, &self.sel.layout, "data-id") else {
                continue;
            };
            let url = select_attr(card, &self.sel.layout, "data-to-posting")
                .map(|suffix| format!("{IMOVELWEB_BASE}{suffix}"));

            let price = select_text(card, &self.sel.price)
                .as_deref()
                .and_then(parse_currency_brl);
            let condo_fee = extract_numeric::<Decimal>(
                card,
                &self.sel.div,
                &self.sel.condo_fee,
                |raw| raw.replace('.', ""),
                None,
            );
            let area =
                extract_numeric::<Decimal>(card, &self.sel.span, &self.sel.area, str::to_string, None);
            let rooms =
                extract_numeric::<Decimal>(card, &self.sel.span, &self.sel.rooms, str::to_string, None);
            let bathrooms = extract_numeric::<Decimal>(
                card,
                &self.sel.span,
                &self.sel.bathrooms,
                str::to_string,
                None,
            );
            let description =
                select_text(card, &self.sel.description).unwrap_or_else(|| NO_DESCRIPTION.into());

            listings.push(ListingRecord {
                platform: Platform::ImovelWeb,
                platform_code,
                description,
                price,
                condo_fee,
                location: select_text(card, &self.sel.location),
                address: select_text(card, &self.sel.address),
                url,
                area,
                rooms,
                bathrooms,
                scraped_at,
            });
        }

        listings
    }
}

// ---------------------------------------------------------------------------
// ZapImóveis
// ---------------------------------------------------------------------------

const ZAP_SEARCH_HEAD: &str = "https://www.zapimoveis.com.br/venda/apartamentos/sc+florianopolis/2-quartos/?transacao=venda&onde=,Santa%20Catarina,Florian%C3%B3polis,,,,,city,BR%3ESanta%20Catarina%3ENULL%3EFlorianopolis,-27.594804,-48.556929,&tipos=apartamento_residencial&pagina=";
const ZAP_SEARCH_TAIL: &str =
    "&banheiros=1,2&quartos=2,3&vagas=1,2&precoMinimo=200000&precoMaximo=1000000";
const ZAP_NO_RESULTS: &str = "Não conseguimos encontrar a página solicitada";

/// Lazy rendering: content grows while the last card is scrolled into view.
#[derive(Debug, Clone)]
pub struct ScrollConfig {
    pub max_iterations: usize,
    /// Loop exit once the rendered-card count holds steady this many
    /// consecutive observations.
    pub stable_observations: usize,
    pub pause: Duration,
}

impl Default for ScrollConfig {
    fn default() -> Self {
        Self {
            max_iterations: 30,
            stable_observations: 2,
            pause: Duration::from_millis(500),
        }
    }
}

struct ZapSelectors {
    card: Selector,
    anchor: Selector,
    paragraph: Selector,
    location: Selector,
    address: Selector,
    area: Selector,
    rooms: Selector,
    bathrooms: Selector,
    price: Regex,
    condo_fee: Regex,
    digits: Regex,
}

impl ZapSelectors {
    fn new() -> Self {
        Self {
            card: static_selector("div[data-position]"),
            anchor: static_selector("a.ListingCard_result-card__Pumtx"),
            paragraph: static_selector("p"),
            location: static_selector(r#"[data-cy="rp-cardProperty-location-txt"]"#),
            address: static_selector(r#"[data-cy="rp-cardProperty-street-txt"]"#),
            area: static_selector(r#"li[data-cy="rp-cardProperty-propertyArea-txt"]"#),
            rooms: static_selector(r#"li[data-cy="rp-cardProperty-bedroomQuantity-txt"]"#),
            bathrooms: static_selector(r#"li[data-cy="rp-cardProperty-bathroomQuantity-txt"]"#),
            price: static_regex(r"([\d\.]+)"),
            condo_fee: static_regex(r"Cond\. R\$ ([\d\.]+)"),
            digits: static_regex(r"(\d+)"),
        }
    }
}

pub struct ZapImoveisAdapter {
    challenge: ChallengePolicy,
    scroll: ScrollConfig,
    sel: ZapSelectors,
}

impl ZapImoveisAdapter {
    pub fn new() -> Self {
        Self {
            challenge: ChallengePolicy::default(),
            scroll: ScrollConfig::default(),
            sel: ZapSelectors::new(),
        }
    }

    pub fn with_challenge_policy(mut self, policy: ChallengePolicy) -> Self {
        self.challenge = policy;
        self
    }

    pub fn with_scroll_config(mut self, scroll: ScrollConfig) -> Self {
        self.scroll = scroll;
        self
    }

    /// Rendered card count and the highest `data-position` currently in the
    /// document. Parsing stays synchronous so nothing non-`Send` lives
    /// across an await.
    fn observe_cards(&self, html: &str) -> (usize, Option<u32>) {
        let document = Html::parse_document(html);
        let mut count = 0usize;
        let mut last_position = None;
        for card in document.select(&self.sel.card) {
            count += 1;
            if let Some(position) = card
                .value()
                .attr("data-position")
                .and_then(|raw| raw.parse::<u32>().ok())
            {
                last_position = Some(last_position.map_or(position, |p: u32| p.max(position)));
            }
        }
        (count, last_position)
    }

    async fn scroll_until_stable(&self, page: &dyn PageDriver) -> Result<String, AdapterError> {
        let mut content = page.content().await?;
        let mut last_count: Option<usize> = None;
        let mut stable = 0usize;

        for iteration in 1..=self.scroll.max_iterations {
            content = page.content().await?;
            let (count, last_position) = self.observe_cards(&content);
            info!(iteration, count, "rendered cards");

            if last_count == Some(count) {
                stable += 1;
                if stable >= self.scroll.stable_observations {
                    info!("card count stable, full content loaded");
                    break;
                }
            } else {
                stable = 0;
                last_count = Some(count);
            }

            match last_position {
                Some(position) => {
                    let selector = format!(r#"div[data-position="{position}"]"#);
                    // A scroll hiccup skips this iteration, never the page.
                    match page.wait_for(&selector, Duration::from_secs(2)).await {
                        Ok(true) => match page.scroll_into_view(&selector).await {
                            Ok(true) => tokio::time::sleep(self.scroll.pause).await,
                            Ok(false) => {
                                warn!(position, "last rendered card vanished before scrolling")
                            }
                            Err(err) => warn!(position, error = %err, "scroll failed"),
                        },
                        Ok(false) => warn!(position, "last rendered card not found"),
                        Err(err) => warn!(position, error = %err, "card lookup failed"),
                    }
                }
                None => warn!(iteration, "no cards rendered yet"),
            }

            tokio::time::sleep(self.scroll.pause).await;
        }

        Ok(content)
    }
}

impl Default for ZapImoveisAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceAdapter for ZapImoveisAdapter {
    fn platform(&self) -> Platform {
        Platform::ZapImoveis
    }

    fn page_urls(&self) -> Box<dyn Iterator<Item = String> + Send> {
        Box::new((1u32..).map(|page| format!("{ZAP_SEARCH_HEAD}{page}{ZAP_SEARCH_TAIL}")))
    }

    async fn fetch_page(
        &self,
        page: &dyn PageDriver,
        url: &str,
    ) -> Result<Option<String>, AdapterError> {
        let Some(content) = fetch_past_challenge(page, url, &self.challenge).await? else {
            return Ok(None);
        };
        if content.contains(ZAP_NO_RESULTS) {
            info!(url, "no more results");
            return Ok(None);
        }
        let content = self.scroll_until_stable(page).await?;
        Ok(Some(content))
    }

    fn parse_page(&self, html: &str) -> Vec<ListingRecord> {
        let document = Html::parse_document(html);
        let scraped_at = Utc::now().with_timezone(&brasilia_offset());
        let mut listings = Vec::new();

        for card in document.select(&self.sel.card) {
            let Some(platform_code) = select_attr(card, &self.sel.anchor, "data-id") else {
                continue;
            };
            let url = select_attr(card, &self.sel.anchor, "href");

            let price = extract_numeric::<Decimal>(
                card,
                &self.sel.paragraph,
                &self.sel.price,
                |raw| raw.replace('.', ""),
                None,
            );
            let condo_fee = extract_numeric::<Decimal>(
                card,
                &self.sel.paragraph,
                &self.sel.condo_fee,
                |raw| raw.replace('.', ""),
                None,
            );
            let area = extract_digits(card, &self.sel.area, &self.sel.digits);
            let rooms = extract_digits(card, &self.sel.rooms, &self.sel.digits);
            let bathrooms = extract_digits(card, &self.sel.bathrooms, &self.sel.digits);

            let description = match (area, rooms, bathrooms) {
                (Some(area), Some(rooms), Some(bathrooms)) => {
                    format!("{area} m², {rooms} quartos, {bathrooms} banheiros")
                }
                _ => NO_DESCRIPTION.to_string(),
            };

            listings.push(ListingRecord {
                platform: Platform::ZapImoveis,
                platform_code,
                description,
                price,
                condo_fee,
                location: select_text(card, &self.sel.location),
                address: select_text(card, &self.sel.address),
                url,
                area,
                rooms,
                bathrooms,
                scraped_at,
            });
        }

        listings
    }
}
