//! Closed regional table and shipment classification.
//!
//! The region set is compiled in; adding a region is a code change.
//! County matching folds diacritics so upstream free text like "Iași",
//! "IASI" or "Bacău" all land in the same bucket.

use serde_json::Value;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::models::{LatLon, Shipment};

/// Regional group the daily routes belong to.
pub const REGION_GROUP: &str = "Moldova";

/// One bucket of the closed region set.
#[derive(Debug, PartialEq)]
pub struct Region {
    /// Canonical name, also used as the route county.
    pub name: &'static str,
    pub code: &'static str,
    /// Folded-comparison aliases for fuzzy county matching.
    pub aliases: &'static [&'static str],
    /// Representative point (county seat), used only as an allocation
    /// tie-breaker, never as a stop.
    pub seed: LatLon,
}

pub static REGIONS: &[Region] = &[
    Region {
        name: "Bacau",
        code: "BC",
        aliases: &["Bacău", "jud Bacau"],
        seed: LatLon {
            lat: 46.5667,
            lon: 26.9167,
        },
    },
    Region {
        name: "Iasi",
        code: "IS",
        aliases: &["Iași", "jud Iasi"],
        seed: LatLon {
            lat: 47.1585,
            lon: 27.6014,
        },
    },
    Region {
        name: "Neamt",
        code: "NT",
        aliases: &["Neamț", "Piatra Neamt", "jud Neamt"],
        seed: LatLon {
            lat: 46.9759,
            lon: 26.3819,
        },
    },
    Region {
        name: "Suceava",
        code: "SV",
        aliases: &["jud Suceava"],
        seed: LatLon {
            lat: 47.6514,
            lon: 26.2556,
        },
    },
    Region {
        name: "Vaslui",
        code: "VS",
        aliases: &["jud Vaslui"],
        seed: LatLon {
            lat: 46.6407,
            lon: 27.7276,
        },
    },
    Region {
        name: "Botosani",
        code: "BT",
        aliases: &["Botoșani", "jud Botosani"],
        seed: LatLon {
            lat: 47.7486,
            lon: 26.6694,
        },
    },
];

/// Fold free text for matching: compatibility-decompose, strip
/// combining marks, collapse whitespace/`_`/`-` runs to single spaces,
/// lowercase.
pub fn fold_text(text: &str) -> String {
    let stripped: String = text
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .map(|c| {
            if c == '_' || c == '-' {
                ' '
            } else {
                c.to_ascii_lowercase()
            }
        })
        .collect();
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Look a region up by canonical name, short code or alias (folded
/// equality only).
pub fn region_by_name(name: &str) -> Option<&'static Region> {
    let folded = fold_text(name);
    if folded.is_empty() {
        return None;
    }
    REGIONS.iter().find(|region| {
        fold_text(region.name) == folded
            || fold_text(region.code) == folded
            || region.aliases.iter().any(|alias| fold_text(alias) == folded)
    })
}

/// Outcome of probing a shipment for a region.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RegionClass {
    Matched(&'static Region),
    /// County text was present but matched no region in the closed set.
    Unmatched,
    /// No county text anywhere on the shipment.
    NoCounty,
}

/// Classify a shipment into the closed region set.
///
/// Candidate text is taken, in priority order, from the shipment's own
/// `county`, then the known upstream `raw_data` fields. The first
/// candidate that matches a region wins.
pub fn classify_region(shipment: &Shipment) -> RegionClass {
    let mut saw_text = false;
    for candidate in candidate_texts(shipment) {
        let folded = fold_text(candidate);
        if folded.is_empty() {
            continue;
        }
        saw_text = true;
        if let Some(region) = match_region(&folded) {
            return RegionClass::Matched(region);
        }
    }
    if saw_text {
        RegionClass::Unmatched
    } else {
        RegionClass::NoCounty
    }
}

/// Canonical region name for a shipment, if it classifies.
pub fn infer_region(shipment: &Shipment) -> Option<&'static str> {
    match classify_region(shipment) {
        RegionClass::Matched(region) => Some(region.name),
        _ => None,
    }
}

/// Whether the shipment's status still allows delivery. Terminal
/// outcomes (delivered, returned, cancelled, refused, in either the
/// upstream Romanian wording or English) are not deliverable; anything
/// else, including an empty status, is.
pub fn is_deliverable(shipment: &Shipment) -> bool {
    const TERMINAL: &[&str] = &[
        "livrat", "returnat", "anulat", "refuz", "delivered", "returned", "cancel", "refused",
    ];
    let folded = fold_text(&shipment.status);
    if folded.is_empty() {
        return true;
    }
    !TERMINAL.iter().any(|needle| folded.contains(needle))
}

fn candidate_texts(shipment: &Shipment) -> Vec<&str> {
    const RAW_PATHS: &[&[&str]] = &[
        &["recipientLocation", "county"],
        &["recipientLocation", "countyName"],
        &["recipientLocation", "region"],
        &["recipientLocation", "regionName"],
        &["county"],
        &["countyName"],
    ];

    let mut texts = Vec::new();
    if let Some(county) = shipment.county.as_deref() {
        texts.push(county);
    }
    if let Some(raw) = shipment.raw_data.as_ref() {
        for path in RAW_PATHS {
            if let Some(text) = raw_str(raw, path) {
                texts.push(text);
            }
        }
    }
    texts
}

fn raw_str<'a>(raw: &'a Value, path: &[&str]) -> Option<&'a str> {
    let mut current = raw;
    for key in path {
        current = current.get(key)?;
    }
    current.as_str().filter(|s| !s.trim().is_empty())
}

/// Match folded candidate text against the region table. Exact and
/// whole-word matches are preferred over bare substring hits so short
/// names don't shadow longer ones.
fn match_region(folded: &str) -> Option<&'static Region> {
    for region in REGIONS {
        if region_needles(region).any(|needle| needle == folded) {
            return Some(region);
        }
    }
    for region in REGIONS {
        if region_needles(region)
            .any(|needle| folded.split(' ').any(|word| word == needle))
        {
            return Some(region);
        }
    }
    for region in REGIONS {
        // Bare substring as a last resort; skip short needles (codes)
        // which would match almost anything.
        if region_needles(region)
            .any(|needle| needle.len() >= 4 && folded.contains(&needle))
        {
            return Some(region);
        }
    }
    None
}

fn region_needles(region: &'static Region) -> impl Iterator<Item = String> {
    std::iter::once(region.name)
        .chain(std::iter::once(region.code))
        .chain(region.aliases.iter().copied())
        .map(fold_text)
}
