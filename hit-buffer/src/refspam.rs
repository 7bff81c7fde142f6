use std::collections::HashSet;

use once_cell::sync::Lazy;

// Referrer hosts that only ever show up to advertise themselves in stats.
static REFSPAM: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "0n-line.tv",
        "100dollars-seo.com",
        "12masterov.com",
        "1pamm.ru",
        "4webmasters.org",
        "5forex.ru",
        "7makemoneyonline.com",
        "adcash.com",
        "anticrawler.org",
        "best-seo-offer.com",
        "best-seo-solution.com",
        "bestwebsitesawards.com",
        "blackhatworth.com",
        "buttons-for-website.com",
        "buttons-for-your-website.com",
        "buy-cheap-online.info",
        "darodar.com",
        "econom.co",
        "event-tracking.com",
        "free-share-buttons.com",
        "free-social-buttons.com",
        "get-free-traffic-now.com",
        "googlsucks.com",
        "hulfingtonpost.com",
        "humanorightswatch.org",
        "ilovevitaly.com",
        "ilovevitaly.ru",
        "iskalko.ru",
        "luxup.ru",
        "o-o-6-o-o.com",
        "o-o-8-o-o.com",
        "priceg.com",
        "rank-checker.online",
        "responsive-test.net",
        "savetubevideo.com",
        "semalt.com",
        "seoanalyses.com",
        "simple-share-buttons.com",
        "social-buttons.com",
        "trafficmonetize.org",
        "webmonetizer.net",
        "website-analyzer.info",
        "yourserverisdown.com",
    ]
    .into_iter()
    .collect()
});

/// Lookup of referrer hosts whose hits are dropped without being stored.
#[derive(Debug, Clone, Default)]
pub struct SpamFilter {
    extra: HashSet<String>,
}

impl SpamFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_extra_hosts<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let extra = hosts
            .into_iter()
            .map(|host| normalize(host.as_ref()))
            .filter(|host| !host.is_empty())
            .collect();
        Self { extra }
    }

    /// Builds a filter from a comma separated host list, as found in config.
    pub fn from_list(list: &str) -> Self {
        Self::with_extra_hosts(list.split(','))
    }

    pub fn is_spam(&self, host: &str) -> bool {
        let host = normalize(host);
        REFSPAM.contains(host.as_str()) || self.extra.contains(&host)
    }
}

fn normalize(host: &str) -> String {
    let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
    match host.strip_prefix("www.") {
        Some(stripped) => stripped.to_string(),
        None => host,
    }
}
