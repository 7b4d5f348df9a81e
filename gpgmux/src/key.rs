//! Key, sub-key, user-id and related value objects.
//!
//! These records are populated by the key listing status handler from
//! colon separated records and handed to callers as `Arc<Key>` on each
//! NEXT_KEY event; sharing is plain reference counting via `Arc`.

use crate::notation::SignatureNotation;
use crate::types::{KeyOrigin, KeylistMode, Protocol, TofuPolicy, Validity};
use crate::util;

#[derive(Debug, Clone, Default)]
pub struct Key {
    pub protocol: Protocol,
    pub keylist_mode: KeylistMode,
    pub revoked: bool,
    pub expired: bool,
    pub disabled: bool,
    pub invalid: bool,
    pub secret: bool,
    pub is_qualified: bool,
    pub can_encrypt: bool,
    pub can_sign: bool,
    pub can_certify: bool,
    pub can_authenticate: bool,
    /// Summaries over the sub-keys, computed when the key is finished.
    pub has_encrypt: bool,
    pub has_sign: bool,
    pub has_certify: bool,
    pub has_authenticate: bool,
    pub owner_trust: Validity,
    pub issuer_serial: Option<String>,
    pub issuer_name: Option<String>,
    pub chain_id: Option<String>,
    /// Fingerprint of the primary sub-key.
    pub fpr: Option<String>,
    pub subkeys: Vec<Subkey>,
    pub uids: Vec<UserId>,
    pub revocation_keys: Vec<RevocationKey>,
    pub last_update: u64,
    pub origin: KeyOrigin,
}

#[derive(Debug, Clone, Default)]
pub struct Subkey {
    pub revoked: bool,
    pub expired: bool,
    pub disabled: bool,
    pub invalid: bool,
    pub can_encrypt: bool,
    pub can_sign: bool,
    pub can_certify: bool,
    pub can_authenticate: bool,
    pub can_renc: bool,
    pub can_timestamp: bool,
    pub is_group_owned: bool,
    pub is_qualified: bool,
    pub is_cardkey: bool,
    pub secret: bool,
    pub is_de_vs: bool,
    pub pubkey_algo: i32,
    pub length: u32,
    pub keyid: String,
    pub fpr: Option<String>,
    /// SHA-256 fingerprint of an X.509 cert, or the alternate v5
    /// fingerprint of an OpenPGP key.
    pub v5fpr: Option<String>,
    pub keygrip: Option<String>,
    /// Creation time; 0 unknown, -1 invalid.
    pub timestamp: i64,
    /// Expiration time; 0 means "does not expire".
    pub expires: i64,
    pub card_number: Option<String>,
    pub curve: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UserId {
    pub revoked: bool,
    pub invalid: bool,
    pub validity: Validity,
    /// The raw user id string.
    pub uid: String,
    pub name: String,
    pub email: String,
    pub comment: String,
    /// The RFC 2822 addr-spec derived from the user id, if any.
    pub address: Option<String>,
    pub uidhash: Option<String>,
    pub tofu: Option<TofuInfo>,
    pub signatures: Vec<KeySignature>,
    pub last_update: u64,
    pub origin: KeyOrigin,
}

#[derive(Debug, Clone, Default)]
pub struct KeySignature {
    pub revoked: bool,
    pub expired: bool,
    pub invalid: bool,
    pub exportable: bool,
    pub pubkey_algo: i32,
    pub keyid: String,
    pub timestamp: i64,
    pub expires: i64,
    /// None is a good signature; the usual suspects otherwise.
    pub status: Option<crate::error::Error>,
    pub sig_class: u32,
    pub uid: String,
    pub name: String,
    pub email: String,
    pub comment: String,
    pub notations: Vec<SignatureNotation>,
    pub trust_depth: u32,
    pub trust_value: u32,
    pub trust_scope: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RevocationKey {
    pub pubkey_algo: i32,
    pub fpr: String,
    pub key_class: u32,
    pub sensitive: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TofuInfo {
    /// 0 = conflict, 1 = no history, 2..4 = increasing history.
    pub validity: u32,
    pub policy: TofuPolicy,
    pub signcount: u16,
    pub encrcount: u16,
    pub signfirst: u64,
    pub signlast: u64,
    pub encrfirst: u64,
    pub encrlast: u64,
    pub description: Option<String>,
}

/// Split a user id of the form `name (comment) <email>` into its
/// parts.  Nesting of brackets is tolerated the way the engines
/// produce it; whatever does not parse stays in `name`.
fn parse_user_id(src: &str) -> (String, String, String) {
    let mut name = String::new();
    let mut email = String::new();
    let mut comment = String::new();

    let bytes = src.as_bytes();
    let mut start = 0usize;
    let mut in_name = false;
    let mut in_email = 0u32;
    let mut in_comment = 0u32;

    let mut i = 0usize;
    while i < bytes.len() {
        let c = bytes[i];
        if in_email > 0 {
            if c == b'<' {
                // Not legal but anyway.
                in_email += 1;
            } else if c == b'>' {
                in_email -= 1;
                if in_email == 0 && email.is_empty() {
                    email = src[start..i].trim_end().to_string();
                }
            }
        } else if in_comment > 0 {
            if c == b'(' {
                in_comment += 1;
            } else if c == b')' {
                in_comment -= 1;
                if in_comment == 0 && comment.is_empty() {
                    comment = src[start..i].trim_end().to_string();
                }
            }
        } else if c == b'<' {
            if in_name {
                if name.is_empty() {
                    name = src[start..i].trim_end().to_string();
                }
                in_name = false;
            }
            in_email = 1;
            start = i + 1;
        } else if c == b'(' {
            if in_name {
                if name.is_empty() {
                    name = src[start..i].trim_end().to_string();
                }
                in_name = false;
            }
            in_comment = 1;
            start = i + 1;
        } else if !in_name && c != b' ' && c != b'\t' {
            in_name = true;
            start = i;
        }
        i += 1;
    }

    if in_name && name.is_empty() {
        name = src[start..].trim_end().to_string();
    }
    (name, email, comment)
}

/// The X.509 variant: the engines hand us a distinguished name, or a
/// plain bracketed mail address.
fn parse_x509_user_id(src: &str) -> (String, String, String) {
    if src.starts_with('<') && src.ends_with('>') {
        (String::new(), src.to_string(), String::new())
    } else {
        (String::new(), String::new(), String::new())
    }
}

/// Derive the addr-spec from a user id.  Either the part in angle
/// brackets or, for a bare mailbox, the user id itself.
pub fn mailbox_from_user_id(uid: &str) -> Option<String> {
    if let Some(lt) = uid.rfind('<') {
        if let Some(gt) = uid[lt..].find('>') {
            let addr = &uid[lt + 1..lt + gt];
            if addr.contains('@') {
                return Some(addr.to_string());
            }
        }
        return None;
    }
    let bare = uid.trim();
    if bare.contains('@') && !bare.contains(' ') && !bare.contains('(') {
        return Some(bare.to_string());
    }
    None
}

impl Key {
    pub fn new() -> Key {
        Key::default()
    }

    /// Append a fresh sub-key and return it for population.
    pub fn add_subkey(&mut self) -> &mut Subkey {
        self.subkeys.push(Subkey::default());
        self.subkeys.last_mut().unwrap()
    }

    /// Take a name from a colon listing, optionally undo the C style
    /// escaping, split it and append it to the user ids.
    pub fn append_name(&mut self, src: &str, convert: bool) {
        let uid_str = if convert { util::decode_c_string(src) } else { src.to_string() };
        let (mut name, mut email, comment) = if self.protocol == Protocol::Cms {
            parse_x509_user_id(&uid_str)
        } else {
            parse_user_id(&uid_str)
        };

        let address = mailbox_from_user_id(&uid_str);
        if email.is_empty() {
            if let Some(addr) = &address {
                if name == *addr {
                    // Name and address are the same; this is a mailbox
                    // only key.  Use the address as email and drop the
                    // name.
                    name.clear();
                    email = addr.clone();
                }
            }
        }

        self.uids.push(UserId {
            uid: uid_str,
            name,
            email,
            comment,
            address,
            ..Default::default()
        });
    }

    pub fn last_uid_mut(&mut self) -> Option<&mut UserId> {
        self.uids.last_mut()
    }

    /// Append a key signature to the most recent user id.  SRC is the
    /// signer's user id as found in the listing.
    pub fn add_sig(&mut self, src: Option<&str>) -> Option<&mut KeySignature> {
        let protocol = self.protocol;
        let uid = self.uids.last_mut()?;
        let mut sig = KeySignature::default();
        if let Some(src) = src {
            let decoded = util::decode_c_string(src);
            let (name, email, comment) = if protocol == Protocol::Cms {
                parse_x509_user_id(&decoded)
            } else {
                parse_user_id(&decoded)
            };
            sig.uid = decoded;
            sig.name = name;
            sig.email = email;
            sig.comment = comment;
        }
        uid.signatures.push(sig);
        uid.signatures.last_mut()
    }

    pub fn add_rev_key(&mut self, fpr: &str) -> &mut RevocationKey {
        self.revocation_keys.push(RevocationKey { fpr: fpr.to_string(), ..Default::default() });
        self.revocation_keys.last_mut().unwrap()
    }
}
