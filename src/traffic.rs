//! Traffic source and entry-page capture
//!
//! Runs synchronously in the engine constructor, before a single-page-app
//! router can rewrite the URL within microtasks. The captured snapshot and
//! the classification derived from it are immutable for the lifetime of the
//! instance.
//!
//! Classification priority:
//! 1. UTM query parameters, when present
//! 2. Referrer hostname: same-origin is `internal`, external referrers are
//!    partitioned into `search | social | email | referral` by hostname
//!    keyword matching, with a search keyword extracted from the common
//!    `q`/`p`/`wd` query-param conventions
//! 3. Otherwise `direct`

use chrono::{DateTime, Utc};
use url::Url;

use crate::types::{EntrySnapshot, TrafficSource, TrafficType};

/// Hostname fragments recognized as search engines.
const SEARCH_HOSTS: &[&str] = &[
    "google", "bing", "yahoo", "duckduckgo", "baidu", "yandex", "ecosia",
];

/// Hostname fragments recognized as social networks.
const SOCIAL_HOSTS: &[&str] = &[
    "facebook",
    "instagram",
    "twitter",
    "x.com",
    "t.co",
    "linkedin",
    "reddit",
    "pinterest",
    "tiktok",
    "youtube",
];

/// Hostname fragments recognized as webmail clients.
const EMAIL_HOSTS: &[&str] = &["mail.", "outlook", "gmail", "protonmail"];

/// Query-param names search engines use for the search phrase.
const SEARCH_KEYWORD_PARAMS: &[&str] = &["q", "p", "wd"];

/// Capture the entry-page facts verbatim.
pub fn capture_entry(
    url: &str,
    title: &str,
    referrer: Option<&str>,
    now: DateTime<Utc>,
) -> EntrySnapshot {
    let query_params = Url::parse(url)
        .map(|parsed| {
            parsed
                .query_pairs()
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect()
        })
        .unwrap_or_default();

    EntrySnapshot {
        url: url.to_string(),
        title: title.to_string(),
        referrer: referrer.filter(|r| !r.is_empty()).map(|r| r.to_string()),
        timestamp: now,
        query_params,
    }
}

/// Classify the traffic source from the captured entry snapshot.
pub fn classify_traffic(entry: &EntrySnapshot) -> TrafficSource {
    if let Some(source) = classify_from_utm(entry) {
        return source;
    }
    if let Some(source) = classify_from_referrer(entry) {
        return source;
    }
    TrafficSource::direct()
}

fn utm_param(entry: &EntrySnapshot, name: &str) -> Option<String> {
    entry
        .query_params
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.clone())
        .filter(|v| !v.is_empty())
}

fn classify_from_utm(entry: &EntrySnapshot) -> Option<TrafficSource> {
    let source = utm_param(entry, "utm_source")?;
    let medium = utm_param(entry, "utm_medium");

    let source_type = classify_utm_type(&source, medium.as_deref());
    Some(TrafficSource {
        source_type,
        source: Some(source),
        medium,
        campaign: utm_param(entry, "utm_campaign"),
        keyword: utm_param(entry, "utm_term"),
    })
}

/// Map a UTM source/medium pair to a traffic type.
fn classify_utm_type(source: &str, medium: Option<&str>) -> TrafficType {
    let medium = medium.unwrap_or("").to_ascii_lowercase();
    let source = source.to_ascii_lowercase();

    if medium.contains("email") {
        return TrafficType::Email;
    }
    if matches!(medium.as_str(), "cpc" | "ppc" | "paid" | "paid_social") {
        return TrafficType::Paid;
    }
    if medium.contains("social") || SOCIAL_HOSTS.iter().any(|h| source.contains(h)) {
        return TrafficType::Social;
    }
    if medium.contains("organic") || medium.contains("search") {
        return TrafficType::Search;
    }
    TrafficType::Campaign
}

fn classify_from_referrer(entry: &EntrySnapshot) -> Option<TrafficSource> {
    let referrer = entry.referrer.as_deref()?;
    let referrer_url = Url::parse(referrer).ok()?;
    let referrer_host = referrer_url.host_str()?.to_ascii_lowercase();

    let own_host = Url::parse(&entry.url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()));

    if Some(&referrer_host) == own_host.as_ref() {
        return Some(TrafficSource {
            source_type: TrafficType::Internal,
            source: Some(referrer_host),
            medium: None,
            campaign: None,
            keyword: None,
        });
    }

    if SEARCH_HOSTS.iter().any(|h| referrer_host.contains(h)) {
        return Some(TrafficSource {
            source_type: TrafficType::Search,
            source: Some(referrer_host),
            medium: Some("organic".to_string()),
            campaign: None,
            keyword: extract_search_keyword(&referrer_url),
        });
    }

    if SOCIAL_HOSTS.iter().any(|h| referrer_host.contains(h)) {
        return Some(TrafficSource {
            source_type: TrafficType::Social,
            source: Some(referrer_host),
            medium: Some("social".to_string()),
            campaign: None,
            keyword: None,
        });
    }

    if EMAIL_HOSTS.iter().any(|h| referrer_host.contains(h)) {
        return Some(TrafficSource {
            source_type: TrafficType::Email,
            source: Some(referrer_host),
            medium: Some("email".to_string()),
            campaign: None,
            keyword: None,
        });
    }

    Some(TrafficSource {
        source_type: TrafficType::Referral,
        source: Some(referrer_host),
        medium: Some("referral".to_string()),
        campaign: None,
        keyword: None,
    })
}

/// Pull the search phrase out of a search-engine referrer URL.
fn extract_search_keyword(referrer: &Url) -> Option<String> {
    referrer
        .query_pairs()
        .find(|(k, _)| SEARCH_KEYWORD_PARAMS.contains(&k.as_ref()))
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn snapshot(url: &str, referrer: Option<&str>) -> EntrySnapshot {
        capture_entry(url, "Landing", referrer, now())
    }

    #[test]
    fn utm_email_wins_regardless_of_referrer() {
        let entry = snapshot(
            "https://shop.example.com/?utm_source=newsletter&utm_medium=email",
            Some("https://www.google.com/search?q=shoes"),
        );
        let source = classify_traffic(&entry);
        assert_eq!(source.source_type, TrafficType::Email);
        assert_eq!(source.source.as_deref(), Some("newsletter"));
        assert_eq!(source.medium.as_deref(), Some("email"));
    }

    #[test]
    fn utm_campaign_and_term_are_captured() {
        let entry = snapshot(
            "https://shop.example.com/?utm_source=spring&utm_medium=cpc&utm_campaign=sale&utm_term=boots",
            None,
        );
        let source = classify_traffic(&entry);
        assert_eq!(source.source_type, TrafficType::Paid);
        assert_eq!(source.campaign.as_deref(), Some("sale"));
        assert_eq!(source.keyword.as_deref(), Some("boots"));
    }

    #[test]
    fn search_referrer_extracts_keyword() {
        let entry = snapshot(
            "https://shop.example.com/",
            Some("https://www.google.com/search?q=red+shoes"),
        );
        let source = classify_traffic(&entry);
        assert_eq!(source.source_type, TrafficType::Search);
        assert_eq!(source.keyword.as_deref(), Some("red shoes"));
        assert_eq!(source.medium.as_deref(), Some("organic"));
    }

    #[test]
    fn baidu_wd_param_is_recognized() {
        let entry = snapshot(
            "https://shop.example.com/",
            Some("https://www.baidu.com/s?wd=keyword"),
        );
        let source = classify_traffic(&entry);
        assert_eq!(source.source_type, TrafficType::Search);
        assert_eq!(source.keyword.as_deref(), Some("keyword"));
    }

    #[test]
    fn same_origin_referrer_is_internal() {
        let entry = snapshot(
            "https://shop.example.com/checkout",
            Some("https://shop.example.com/cart"),
        );
        let source = classify_traffic(&entry);
        assert_eq!(source.source_type, TrafficType::Internal);
    }

    #[test]
    fn social_referrer_classifies() {
        let entry = snapshot("https://shop.example.com/", Some("https://t.co/abc123"));
        let source = classify_traffic(&entry);
        assert_eq!(source.source_type, TrafficType::Social);
    }

    #[test]
    fn unknown_referrer_is_referral() {
        let entry = snapshot(
            "https://shop.example.com/",
            Some("https://blog.partner.io/review"),
        );
        let source = classify_traffic(&entry);
        assert_eq!(source.source_type, TrafficType::Referral);
        assert_eq!(source.source.as_deref(), Some("blog.partner.io"));
    }

    #[test]
    fn no_referrer_is_direct() {
        let entry = snapshot("https://shop.example.com/", None);
        assert_eq!(classify_traffic(&entry).source_type, TrafficType::Direct);

        let empty = snapshot("https://shop.example.com/", Some(""));
        assert_eq!(classify_traffic(&empty).source_type, TrafficType::Direct);
    }

    #[test]
    fn snapshot_preserves_query_params_verbatim() {
        let entry = snapshot("https://shop.example.com/?a=1&b=two", None);
        assert_eq!(
            entry.query_params,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "two".to_string())
            ]
        );
    }
}
