//! Channel filtering and group derivation.
//!
//! Pure functions over a channel catalog snapshot. Sessions carry
//! their own [`FilterSettings`]; groups are rebuilt from scratch on
//! each groups-count request rather than maintained incrementally.

use std::collections::BTreeMap;

use crate::backend::Channel;

/// Channel classes a client can enumerate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Any,
    RadioOnly,
    HdOnly,
}

impl From<u32> for ChannelKind {
    fn from(value: u32) -> Self {
        match value {
            1 => ChannelKind::RadioOnly,
            2 => ChannelKind::HdOnly,
            _ => ChannelKind::Any,
        }
    }
}

/// Per-session channel list filter, adjustable over the wire.
#[derive(Debug, Clone)]
pub struct FilterSettings {
    /// Include free-to-air channels.
    pub want_fta: bool,
    /// Exclude channels without an audio track in the preferred
    /// language.
    pub language_only: bool,
    pub language_index: Option<usize>,
    /// Allowed conditional-access ids; empty acts as a wildcard.
    pub caids: Vec<u32>,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            want_fta: true,
            language_only: false,
            language_index: None,
            caids: Vec::new(),
        }
    }
}

/// Video format ids that classify a channel as (U)HD.
fn is_hd(channel: &Channel) -> bool {
    channel.vtype == 27 || channel.vtype == 36
}

/// Decide whether a channel belongs in a client's list of `kind`.
pub fn wanted(channel: &Channel, kind: ChannelKind, filter: &FilterSettings) -> bool {
    match kind {
        ChannelKind::RadioOnly => {
            if !channel.is_radio() {
                return false;
            }
        }
        // Radio classification wins over the video format id, so the
        // radio and HD lists never overlap.
        ChannelKind::HdOnly => {
            if channel.is_radio() || !is_hd(channel) {
                return false;
            }
        }
        ChannelKind::Any => {}
    }

    // untunable placeholders and the "." sentinel
    if channel.sid == 0 {
        return false;
    }
    if channel.name == "." {
        return false;
    }

    if filter.language_only {
        if let Some(index) = filter.language_index {
            let found = channel
                .audio_langs
                .iter()
                .chain(channel.digital_langs.iter())
                .any(|lang| language_index(lang) == Some(index));
            if !found {
                return false;
            }
        }
    }

    // free-to-air channels follow the client's FTA preference
    if channel.ca() == 0 {
        return filter.want_fta;
    }

    // encrypted: empty allowed set is a wildcard
    if filter.caids.is_empty() {
        return true;
    }

    channel.caids.iter().any(|ca| filter.caids.contains(ca))
}

/// Channel count as the count operation reports it: every channel is
/// considered once for the full list and once for the radio list, so a
/// radio channel contributes twice.
pub fn count_wanted(channels: &[Channel], filter: &FilterSettings) -> u32 {
    let mut count = 0;
    for channel in channels {
        if wanted(channel, ChannelKind::Any, filter) {
            count += 1;
        }
        if wanted(channel, ChannelKind::RadioOnly, filter) {
            count += 1;
        }
    }
    count
}

/// A named channel group within one of the two group catalogs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelGroup {
    pub name: String,
    pub radio: bool,
    /// Derived from provider names rather than explicit separators.
    pub automatic: bool,
}

/// Radio and TV group catalogs, keyed by group name.
#[derive(Debug, Default)]
pub struct GroupCatalogs {
    pub tv: BTreeMap<String, ChannelGroup>,
    pub radio: BTreeMap<String, ChannelGroup>,
}

impl GroupCatalogs {
    pub fn by_radio(&self, radio: bool) -> &BTreeMap<String, ChannelGroup> {
        if radio {
            &self.radio
        } else {
            &self.tv
        }
    }

    pub fn total(&self) -> u32 {
        (self.tv.len() + self.radio.len()) as u32
    }
}

/// Group key for one channel during a single in-order pass.
///
/// `automatic` keys non-separator entries by their provider name;
/// otherwise the name of the most recent separator applies to every
/// following entry until the next separator. `last_sep` carries that
/// state between calls.
pub fn group_key(channel: &Channel, automatic: bool, last_sep: &mut String) -> Option<String> {
    if automatic {
        if channel.group_sep {
            return None;
        }
        if channel.provider.is_empty() {
            return None;
        }
        return Some(channel.provider.clone());
    }

    if channel.group_sep {
        *last_sep = channel.name.clone();
        return None;
    }
    if last_sep.is_empty() {
        return None;
    }
    Some(last_sep.clone())
}

/// Rebuild both group catalogs from a channel snapshot.
pub fn compute_groups(
    channels: &[Channel],
    automatic: bool,
    filter: &FilterSettings,
) -> GroupCatalogs {
    let mut catalogs = GroupCatalogs::default();
    let mut last_sep = String::new();

    for channel in channels {
        let Some(name) = group_key(channel, automatic, &mut last_sep) else {
            continue;
        };

        let radio = channel.is_radio();
        let kind = if radio {
            ChannelKind::RadioOnly
        } else {
            ChannelKind::Any
        };
        if !wanted(channel, kind, filter) {
            continue;
        }

        let map = if radio {
            &mut catalogs.radio
        } else {
            &mut catalogs.tv
        };
        map.entry(name.clone()).or_insert(ChannelGroup {
            name,
            radio,
            automatic,
        });
    }

    catalogs
}

/// Language alias table; the preferred-language index on the wire is a
/// position in this table.
const LANGUAGES: &[&[&str]] = &[
    &["eng", "en"],
    &["deu", "ger", "de"],
    &["fra", "fre", "fr"],
    &["ita", "it"],
    &["spa", "esl", "es"],
    &["por", "pt"],
    &["nld", "dut", "nl"],
    &["dan", "da"],
    &["swe", "sv"],
    &["nor", "no"],
    &["fin", "fi"],
    &["pol", "pl"],
    &["ces", "cze", "cs"],
    &["slk", "slo", "sk"],
    &["hun", "hu"],
    &["ell", "gre", "el"],
    &["rus", "ru"],
    &["tur", "tr"],
    &["ara", "ar"],
    &["jpn", "ja"],
];

/// Index of a language tag in the alias table.
pub fn language_index(code: &str) -> Option<usize> {
    let code = code.trim();
    LANGUAGES
        .iter()
        .position(|aliases| aliases.iter().any(|a| a.eq_ignore_ascii_case(code)))
}

/// Canonical code for an index, for logging.
pub fn language_code(index: usize) -> Option<&'static str> {
    LANGUAGES.get(index).map(|aliases| aliases[0])
}
