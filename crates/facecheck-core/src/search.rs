//! Reverse image search links.
//!
//! Pure URL construction: no network access, no failure mode. Local uploads
//! get each engine's upload page; images with a public URL get a direct
//! search-by-URL link.

use serde::{Deserialize, Serialize};
use std::fmt::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchEngine {
    GoogleImages,
    BingVisualSearch,
    TinEye,
}

impl SearchEngine {
    pub const ALL: [SearchEngine; 3] = [
        SearchEngine::GoogleImages,
        SearchEngine::BingVisualSearch,
        SearchEngine::TinEye,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SearchEngine::GoogleImages => "Google Images",
            SearchEngine::BingVisualSearch => "Bing Visual Search",
            SearchEngine::TinEye => "TinEye",
        }
    }

    fn upload_page(self) -> &'static str {
        match self {
            SearchEngine::GoogleImages => "https://images.google.com",
            SearchEngine::BingVisualSearch => "https://www.bing.com/visualsearch",
            SearchEngine::TinEye => "https://tineye.com",
        }
    }

    fn by_url_prefix(self) -> &'static str {
        match self {
            SearchEngine::GoogleImages => "https://lens.google.com/uploadbyurl?url=",
            SearchEngine::BingVisualSearch => {
                "https://www.bing.com/images/search?view=detailv2&iss=sbi&q=imgurl:"
            }
            SearchEngine::TinEye => "https://tineye.com/search?url=",
        }
    }
}

/// What a link should point the search engine at.
#[derive(Debug, Clone, Copy)]
pub enum ImageRef<'a> {
    /// An image only available locally; the user uploads it by hand.
    Local,
    /// An image reachable at a public URL.
    Url(&'a str),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchLink {
    pub engine: SearchEngine,
    pub url: String,
}

/// One link per supported engine, in [`SearchEngine::ALL`] order.
pub fn reverse_search_links(image: ImageRef<'_>) -> Vec<SearchLink> {
    SearchEngine::ALL
        .iter()
        .map(|&engine| SearchLink {
            engine,
            url: match image {
                ImageRef::Local => engine.upload_page().to_string(),
                ImageRef::Url(url) => format!("{}{}", engine.by_url_prefix(), percent_encode(url)),
            },
        })
        .collect()
}

/// Percent-encode everything outside the RFC 3986 unreserved set.
fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len() * 3);
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => {
                let _ = write!(out, "%{byte:02X}");
            }
        }
    }
    out
}
