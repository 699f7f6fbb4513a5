//! Public key records parsed from gpg's colon listing
//!
//! `gpg --with-colons --fixed-list-mode` prints one colon-separated record
//! per line. A key is a stanza that starts at a `pub` record and runs until
//! the next one; its `fpr` and `uid` records follow the `pub` line.
//!
//! ```text
//! pub:u:2048:17:0247FEC05FDA4350:2010-09-13:::u:John Example <john@example.com>::scESC:
//! ```
//!
//! Field 1 is the validity, 2 the key length, 4 the key id, 5 the creation
//! date and 9 the user id. A key is only useful here if one of its user ids
//! carries an e-mail address.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, NaiveDate};
use regex::Regex;
use serde::Serialize;

// ============================================================================
// Constants
// ============================================================================

const FIELD_VALIDITY: usize = 1;
const FIELD_LENGTH: usize = 2;
const FIELD_KEY_ID: usize = 4;
const FIELD_CREATED: usize = 5;
const FIELD_USER_ID: usize = 9;

// ============================================================================
// Types
// ============================================================================

/// Calculated validity of a key, from field 1 of its `pub` record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Validity {
    /// `o`: new to the system
    New,
    /// `-` or empty: no ownertrust assigned yet
    Unknown,
    /// `q`: undefined
    Undefined,
    /// `m`
    Marginal,
    /// `f`
    Full,
    /// `u`
    Ultimate,
    /// `n`: never valid
    Never,
    /// `i`
    Invalid,
    /// `d`
    Disabled,
    /// `r`
    Revoked,
    /// `e`
    Expired,
    Other,
}

impl Validity {
    pub fn from_field(field: &str) -> Self {
        match field.chars().next() {
            None | Some('-') => Self::Unknown,
            Some('o') => Self::New,
            Some('q') => Self::Undefined,
            Some('m') => Self::Marginal,
            Some('f') => Self::Full,
            Some('u') => Self::Ultimate,
            Some('n') => Self::Never,
            Some('i') => Self::Invalid,
            Some('d') => Self::Disabled,
            Some('r') => Self::Revoked,
            Some('e') => Self::Expired,
            Some(_) => Self::Other,
        }
    }

    /// Whether gpg would still encrypt to a key with this validity
    pub fn is_usable(self) -> bool {
        matches!(
            self,
            Self::New | Self::Unknown | Self::Undefined | Self::Marginal | Self::Full | Self::Ultimate
        )
    }
}

/// A record that could not be turned into a [`Key`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unable to parse key record {record:?}: {reason}")]
pub struct MalformedRecord {
    pub reason: String,
    pub record: String,
}

impl MalformedRecord {
    pub fn new(reason: impl Into<String>, record: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            record: record.into(),
        }
    }
}

/// An installed (or inspected) public key with at least one e-mail address
///
/// Keys compare and hash by key id only.
#[derive(Debug, Clone, Serialize)]
pub struct Key {
    /// Long key id, upper-case hex
    pub key_id: String,

    /// Primary key fingerprint, when gpg printed an `fpr` record
    pub fingerprint: Option<String>,

    /// Primary address, lower-cased
    pub email: String,

    /// Display name from the user id that supplied `email`
    pub name: Option<String>,

    /// Every address on the key, lower-cased, primary first
    pub addresses: Vec<String>,

    pub validity: Validity,

    pub length: Option<u32>,

    pub created: Option<NaiveDate>,
}

impl Key {
    /// Identifier handed to `--recipient` and `--delete-key`
    pub fn selector(&self) -> &str {
        self.fingerprint.as_deref().unwrap_or(&self.key_id)
    }

    /// Case-insensitive match against any of the key's addresses
    pub fn has_address(&self, email: &str) -> bool {
        let wanted = normalize_email(email);
        self.addresses.iter().any(|address| *address == wanted)
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.key_id == other.key_id
    }
}

impl Eq for Key {}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key_id.hash(state);
    }
}

/// Keys order by primary address, then key id; the same key id is always equal
impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.key_id == other.key_id {
            return Ordering::Equal;
        }
        self.email
            .cmp(&other.email)
            .then_with(|| self.key_id.cmp(&other.key_id))
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Outcome of looking a key up by address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyLookup {
    Found(Key),
    NotFound,
    /// A record mentioning the address exists but could not be parsed
    Malformed(MalformedRecord),
}

impl KeyLookup {
    pub fn found(self) -> Option<Key> {
        match self {
            Self::Found(key) => Some(key),
            _ => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Self::Found(_))
    }
}

/// Canonical form used for every address comparison
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

// ============================================================================
// Parser
// ============================================================================

/// Parses colon listings into [`Key`] values using compiled user id patterns
#[derive(Debug, Clone)]
pub struct KeyParser {
    /// `Display Name <address@example.com>` or `<address@example.com>`
    bracketed_regex: Regex,
    /// Bare `address@example.com`
    bare_regex: Regex,
}

impl KeyParser {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            bracketed_regex: Regex::new(r"^(?P<name>.*?)\s*<(?P<mail>[^<>\s]+@[^<>\s]+)>")?,
            bare_regex: Regex::new(r"^(?P<mail>[^<>\s@]+@[^<>\s@]+)$")?,
        })
    }

    /// Split a user id into an optional display name and an address
    pub fn parse_user_id(&self, user_id: &str) -> Option<(Option<String>, String)> {
        let user_id = user_id.trim();

        if let Some(captures) = self.bracketed_regex.captures(user_id) {
            let name = captures.name("name").map(|m| m.as_str().trim().to_string());
            let mail = captures.name("mail")?.as_str();
            return Some((name.filter(|n| !n.is_empty()), normalize_email(mail)));
        }

        let captures = self.bare_regex.captures(user_id)?;
        Some((None, normalize_email(captures.name("mail")?.as_str())))
    }

    /// Parse a single stanza (a `pub` record plus its trailing records)
    pub fn parse_stanza(&self, stanza: &str) -> Result<Key, MalformedRecord> {
        let malformed = |reason: &str| MalformedRecord::new(reason, stanza.trim_end());

        let mut lines = stanza.lines().filter(|line| !line.trim().is_empty());
        let pub_line = lines.next().ok_or_else(|| malformed("empty record"))?;
        let fields: Vec<&str> = pub_line.split(':').collect();

        if fields.first() != Some(&"pub") {
            return Err(malformed("record does not start with a pub line"));
        }

        let key_id = fields
            .get(FIELD_KEY_ID)
            .filter(|id| !id.is_empty() && id.chars().all(|c| c.is_ascii_hexdigit()))
            .ok_or_else(|| malformed("missing or non-hex key id"))?
            .to_ascii_uppercase();

        let validity = Validity::from_field(fields.get(FIELD_VALIDITY).unwrap_or(&""));
        let length = fields.get(FIELD_LENGTH).and_then(|l| l.parse().ok());
        let created = fields.get(FIELD_CREATED).and_then(|c| parse_date(c));

        let mut user_ids = Vec::new();
        if let Some(user_id) = fields.get(FIELD_USER_ID).filter(|u| !u.is_empty()) {
            user_ids.push(unescape(user_id));
        }

        let mut fingerprint = None;
        for line in lines {
            let fields: Vec<&str> = line.split(':').collect();
            match fields.first().copied() {
                // Subkey records and their fingerprints follow the primary key's
                Some("sub") | Some("ssb") => break,
                Some("fpr") if fingerprint.is_none() => {
                    fingerprint = fields
                        .get(FIELD_USER_ID)
                        .filter(|f| !f.is_empty())
                        .map(|f| f.to_ascii_uppercase());
                }
                Some("uid") => {
                    // A revoked primary key marks every uid revoked; its
                    // validity already says the key is unusable
                    let revoked = fields.get(FIELD_VALIDITY) == Some(&"r")
                        && validity != Validity::Revoked;
                    if let Some(user_id) = fields.get(FIELD_USER_ID).filter(|u| !u.is_empty()) {
                        if !revoked {
                            user_ids.push(unescape(user_id));
                        }
                    }
                }
                _ => {}
            }
        }

        let mut primary: Option<(Option<String>, String)> = None;
        let mut addresses = Vec::new();
        for user_id in &user_ids {
            if let Some((name, mail)) = self.parse_user_id(user_id) {
                if !addresses.contains(&mail) {
                    addresses.push(mail.clone());
                }
                primary.get_or_insert((name, mail));
            }
        }

        let (name, email) = primary.ok_or_else(|| malformed("no e-mail address in any user id"))?;

        Ok(Key {
            key_id,
            fingerprint,
            email,
            name,
            addresses,
            validity,
            length,
            created,
        })
    }

    /// Parse every stanza of a listing, keeping failures alongside successes
    pub fn parse_listing(&self, output: &str) -> Vec<Result<Key, MalformedRecord>> {
        split_stanzas(output)
            .into_iter()
            .map(|stanza| self.parse_stanza(&stanza))
            .collect()
    }
}

/// Group listing lines into stanzas, one per `pub` record
///
/// Lines before the first `pub` record (`tru:` headers and the like) belong
/// to no key and are dropped.
pub fn split_stanzas(output: &str) -> Vec<String> {
    let mut stanzas: Vec<String> = Vec::new();

    for line in output.lines() {
        if line.starts_with("pub:") {
            stanzas.push(String::new());
        }
        if let Some(current) = stanzas.last_mut() {
            current.push_str(line);
            current.push('\n');
        }
    }

    stanzas
}

/// Creation dates are `YYYY-MM-DD` in older listings and epoch seconds in newer ones
fn parse_date(field: &str) -> Option<NaiveDate> {
    if field.contains('-') {
        NaiveDate::parse_from_str(field, "%Y-%m-%d").ok()
    } else {
        let seconds = field.parse::<i64>().ok()?;
        DateTime::from_timestamp(seconds, 0).map(|timestamp| timestamp.date_naive())
    }
}

/// Undo gpg's `\xHH` escaping of colons and control characters in user ids
fn unescape(field: &str) -> String {
    if !field.contains("\\x") {
        return field.to_string();
    }

    let bytes = field.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && bytes.get(i + 1) == Some(&b'x') {
            if let Some(byte) = field
                .get(i + 2..i + 4)
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
            {
                decoded.push(byte);
                i += 4;
                continue;
            }
        }
        decoded.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&decoded).into_owned()
}

// ============================================================================
// Tests
// ============================================================================
