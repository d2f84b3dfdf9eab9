// In-memory entry storage: DN handling, entries, filter matching and the
// operations the request pipeline applies to them

use std::cmp::Ordering;
use std::collections::HashMap;

use dashmap::DashMap;
use parking_lot::Mutex;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::error::{LdapError, LdapResultOf};
use crate::ldap_protocol::{
    Attribute, Filter, Modification, ModificationType, ResultCode, SearchResultEntry, SearchScope,
};

/// Splits a DN into its RDNs, honouring backslash escapes and quoted values.
pub fn split_dn(dn: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    let mut quoted = false;
    for (i, c) in dn.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '"' => quoted = !quoted,
            ',' | ';' if !quoted => {
                parts.push(dn[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    let last = dn[start..].trim();
    if !last.is_empty() || !parts.is_empty() {
        parts.push(last);
    }
    parts
}

/// `attr=value` pairs of one RDN, with escapes removed from the values.
pub fn rdn_components(rdn: &str) -> Vec<(String, String)> {
    let mut components = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    let mut pieces = Vec::new();
    for (i, c) in rdn.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '+' => {
                pieces.push(&rdn[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    pieces.push(&rdn[start..]);
    for piece in pieces {
        if let Some((name, value)) = piece.split_once('=') {
            components.push((name.trim().to_string(), unescape(value.trim())));
        }
    }
    components
}

fn unescape(value: &str) -> String {
    let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value);
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn normalize_rdn(rdn: &str) -> String {
    let mut components: Vec<String> = rdn_components(rdn)
        .into_iter()
        .map(|(name, value)| format!("{}={}", name.to_ascii_lowercase(), value.to_lowercase()))
        .collect();
    components.sort();
    components.join("+")
}

/// Canonical form used as the storage key: lowercase, no insignificant spaces.
pub fn normalize_dn(dn: &str) -> String {
    split_dn(dn)
        .iter()
        .map(|rdn| normalize_rdn(rdn))
        .collect::<Vec<_>>()
        .join(",")
}

/// Parent of `dn`; `None` for the root DSE.
pub fn parent_dn(dn: &str) -> Option<String> {
    let parts = split_dn(dn);
    if parts.is_empty() {
        return None;
    }
    Some(parts[1..].join(","))
}

/// True if normalized `dn` equals or sits below normalized `base`.
pub fn is_within(dn: &str, base: &str) -> bool {
    if base.is_empty() {
        return true;
    }
    dn == base || (dn.len() > base.len() && dn.ends_with(base) && dn.as_bytes()[dn.len() - base.len() - 1] == b',')
}

/// Values of password-like attributes compare byte for byte; everything else ignores ASCII case.
fn values_equal(attribute: &str, a: &[u8], b: &[u8]) -> bool {
    if attribute.to_ascii_lowercase().contains("password") {
        a == b
    } else {
        a.eq_ignore_ascii_case(b)
    }
}

fn compare_ordered(a: &[u8], b: &[u8]) -> Ordering {
    let parsed = (
        std::str::from_utf8(a).ok().and_then(|s| s.trim().parse::<i64>().ok()),
        std::str::from_utf8(b).ok().and_then(|s| s.trim().parse::<i64>().ok()),
    );
    match parsed {
        (Some(x), Some(y)) => x.cmp(&y),
        _ => a.to_ascii_lowercase().cmp(&b.to_ascii_lowercase()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    dn: String,
    attributes: Vec<Attribute>,
}

impl Entry {
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attributes: Vec::new(),
        }
    }

    pub fn from_attributes(dn: impl Into<String>, attributes: Vec<Attribute>) -> Self {
        let mut entry = Self::new(dn);
        for attribute in attributes {
            entry.add_values(&attribute.name, attribute.values, true).ok();
        }
        entry
    }

    pub fn dn(&self) -> &str {
        &self.dn
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes
            .iter()
            .find(|a| a.name.eq_ignore_ascii_case(name))
    }

    pub fn values(&self, name: &str) -> &[Vec<u8>] {
        self.attribute(name).map(|a| a.values.as_slice()).unwrap_or(&[])
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attribute(name).is_some()
    }

    pub fn has_value(&self, name: &str, value: &[u8]) -> bool {
        self.values(name).iter().any(|v| values_equal(name, v, value))
    }

    fn attribute_mut(&mut self, name: &str) -> Option<&mut Attribute> {
        self.attributes
            .iter_mut()
            .find(|a| a.name.eq_ignore_ascii_case(name))
    }

    /// Adds values; an existing value is an error unless `permissive`.
    pub fn add_values(
        &mut self,
        name: &str,
        values: Vec<Vec<u8>>,
        permissive: bool,
    ) -> LdapResultOf<()> {
        if values.is_empty() {
            return Err(LdapError::new(
                ResultCode::PROTOCOL_ERROR,
                format!("no values supplied for attribute {}", name),
            ));
        }
        if self.attribute(name).is_none() {
            self.attributes.push(Attribute::new(name, Vec::new()));
        }
        for value in values {
            if self.has_value(name, &value) {
                if permissive {
                    continue;
                }
                return Err(LdapError::new(
                    ResultCode::ATTRIBUTE_OR_VALUE_EXISTS,
                    format!("attribute {} already has the value being added", name),
                ));
            }
            if let Some(attribute) = self.attribute_mut(name) {
                attribute.values.push(value);
            }
        }
        Ok(())
    }

    /// Removes the given values, or the whole attribute when `values` is empty.
    pub fn remove_values(
        &mut self,
        name: &str,
        values: &[Vec<u8>],
        permissive: bool,
    ) -> LdapResultOf<()> {
        let missing = || {
            LdapError::new(
                ResultCode::NO_SUCH_ATTRIBUTE,
                format!("attribute {} does not have the value being removed", name),
            )
        };
        let Some(attribute) = self.attribute_mut(name) else {
            return if permissive { Ok(()) } else { Err(missing()) };
        };
        for value in values {
            match attribute.values.iter().position(|v| values_equal(name, v, value)) {
                Some(index) => {
                    attribute.values.remove(index);
                }
                None if permissive => {}
                None => return Err(missing()),
            }
        }
        if values.is_empty() || attribute.values.is_empty() {
            self.attributes.retain(|a| !a.name.eq_ignore_ascii_case(name));
        }
        Ok(())
    }

    pub fn replace_values(&mut self, name: &str, values: Vec<Vec<u8>>) {
        self.attributes.retain(|a| !a.name.eq_ignore_ascii_case(name));
        if !values.is_empty() {
            self.attributes.push(Attribute::new(name, values));
        }
    }

    fn increment(&mut self, name: &str, values: &[Vec<u8>]) -> LdapResultOf<()> {
        let delta = match values {
            [value] => std::str::from_utf8(value)
                .ok()
                .and_then(|s| s.trim().parse::<i64>().ok()),
            _ => None,
        }
        .ok_or_else(|| {
            LdapError::new(
                ResultCode::PROTOCOL_ERROR,
                "increment requires exactly one integer value",
            )
        })?;
        let attribute = self.attribute_mut(name).ok_or_else(|| {
            LdapError::new(
                ResultCode::NO_SUCH_ATTRIBUTE,
                format!("cannot increment missing attribute {}", name),
            )
        })?;
        for value in attribute.values.iter_mut() {
            let current = std::str::from_utf8(value)
                .ok()
                .and_then(|s| s.trim().parse::<i64>().ok())
                .ok_or_else(|| {
                    LdapError::new(
                        ResultCode::CONSTRAINT_VIOLATION,
                        format!("attribute {} has a non-integer value", name),
                    )
                })?;
            *value = current.wrapping_add(delta).to_string().into_bytes();
        }
        Ok(())
    }

    pub fn apply_modification(
        &mut self,
        modification: &Modification,
        permissive: bool,
    ) -> LdapResultOf<()> {
        let name = modification.attribute.name.as_str();
        let values = &modification.attribute.values;
        match modification.operation {
            ModificationType::Add => self.add_values(name, values.clone(), permissive),
            ModificationType::Delete => self.remove_values(name, values, permissive),
            ModificationType::Replace => {
                self.replace_values(name, values.clone());
                Ok(())
            }
            ModificationType::Increment => self.increment(name, values),
        }
    }

    /// Copy of the entry under another DN.
    fn renamed(&self, dn: String) -> Self {
        Self {
            dn,
            attributes: self.attributes.clone(),
        }
    }

    /// Builds the search result form, keeping only the requested attributes.
    /// An empty list, `*`, or `+` selects all user attributes; `1.1` selects none.
    pub fn to_search_entry(&self, requested: &[String], types_only: bool) -> SearchResultEntry {
        let all = requested.is_empty() || requested.iter().any(|a| a == "*" || a == "+");
        let none = requested.len() == 1 && requested[0] == "1.1";
        let attributes = self
            .attributes
            .iter()
            .filter(|a| !none && (all || requested.iter().any(|r| r.eq_ignore_ascii_case(&a.name))))
            .map(|a| Attribute {
                name: a.name.clone(),
                values: if types_only { Vec::new() } else { a.values.clone() },
            })
            .collect();
        SearchResultEntry {
            dn: self.dn.clone(),
            attributes,
        }
    }

    /// Evaluates a search filter against this entry.
    pub fn matches(&self, filter: &Filter) -> bool {
        match filter {
            Filter::And(filters) => filters.iter().all(|f| self.matches(f)),
            Filter::Or(filters) => filters.iter().any(|f| self.matches(f)),
            Filter::Not(inner) => !self.matches(inner),
            Filter::Equality { attribute, value } | Filter::Approximate { attribute, value } => {
                self.has_value(attribute, value)
            }
            Filter::GreaterOrEqual { attribute, value } => self
                .values(attribute)
                .iter()
                .any(|v| compare_ordered(v, value) != Ordering::Less),
            Filter::LessOrEqual { attribute, value } => self
                .values(attribute)
                .iter()
                .any(|v| compare_ordered(v, value) != Ordering::Greater),
            Filter::Present(attribute) => self.has_attribute(attribute),
            Filter::Substrings {
                attribute,
                initial,
                any,
                final_,
            } => self.values(attribute).iter().any(|v| {
                substring_match(v, initial.as_deref(), any, final_.as_deref())
            }),
            Filter::Extensible {
                attribute,
                value,
                dn_attributes,
                ..
            } => {
                let in_entry = match attribute {
                    Some(name) => self.has_value(name, value),
                    None => self
                        .attributes
                        .iter()
                        .any(|a| a.values.iter().any(|v| v.eq_ignore_ascii_case(value))),
                };
                in_entry
                    || (*dn_attributes
                        && split_dn(&self.dn).iter().any(|rdn| {
                            rdn_components(rdn).iter().any(|(name, v)| {
                                attribute.as_ref().map_or(true, |a| a.eq_ignore_ascii_case(name))
                                    && v.as_bytes().eq_ignore_ascii_case(value)
                            })
                        }))
            }
        }
    }
}

fn substring_match(value: &[u8], initial: Option<&[u8]>, any: &[Vec<u8>], final_: Option<&[u8]>) -> bool {
    let value = value.to_ascii_lowercase();
    let mut rest: &[u8] = &value;
    if let Some(initial) = initial {
        let initial = initial.to_ascii_lowercase();
        if !rest.starts_with(&initial) {
            return false;
        }
        rest = &rest[initial.len()..];
    }
    for part in any {
        let part = part.to_ascii_lowercase();
        if part.is_empty() {
            continue;
        }
        match rest.windows(part.len()).position(|w| w == part.as_slice()) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }
    match final_ {
        Some(final_) => rest.ends_with(&final_.to_ascii_lowercase()),
        None => true,
    }
}

/// Storage collaborator: entries keyed by normalized DN.
pub trait EntryStore: Send + Sync {
    fn get(&self, dn: &str) -> Option<Entry>;
    fn put(&self, entry: Entry);
    fn remove(&self, dn: &str) -> Option<Entry>;
    fn contains(&self, dn: &str) -> bool;
    /// All entries at or below `base` (normalized).
    fn subtree(&self, base: &str) -> Vec<Entry>;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    entries: DashMap<String, Entry>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EntryStore for InMemoryStore {
    fn get(&self, dn: &str) -> Option<Entry> {
        self.entries.get(&normalize_dn(dn)).map(|e| e.value().clone())
    }

    fn put(&self, entry: Entry) {
        self.entries.insert(normalize_dn(entry.dn()), entry);
    }

    fn remove(&self, dn: &str) -> Option<Entry> {
        self.entries.remove(&normalize_dn(dn)).map(|(_, entry)| entry)
    }

    fn contains(&self, dn: &str) -> bool {
        self.entries.contains_key(&normalize_dn(dn))
    }

    fn subtree(&self, base: &str) -> Vec<Entry> {
        let base = normalize_dn(base);
        self.entries
            .iter()
            .filter(|e| is_within(e.key(), &base))
            .map(|e| e.value().clone())
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// The directory the request pipeline operates on. Reads go straight to the
/// store; updates are serialized so multi-entry changes stay consistent.
pub struct Directory {
    store: Box<dyn EntryStore>,
    /// Normalized, for containment checks.
    base_dns: Vec<String>,
    naming_contexts: Vec<String>,
    password_attributes: Vec<String>,
    additional_credentials: HashMap<String, Vec<u8>>,
    root_dse: Mutex<Entry>,
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for Directory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Directory")
            .field("base_dns", &self.naming_contexts)
            .field("entries", &self.store.len())
            .field("password_attributes", &self.password_attributes)
            .field("additional_credentials", &self.additional_credentials.len())
            .finish()
    }
}

impl Directory {
    pub fn new(store: Box<dyn EntryStore>, base_dns: &[String]) -> Self {
        Self {
            store,
            base_dns: base_dns.iter().map(|dn| normalize_dn(dn)).collect(),
            naming_contexts: base_dns.iter().map(|dn| dn.trim().to_string()).collect(),
            password_attributes: vec!["userPassword".to_string()],
            additional_credentials: HashMap::new(),
            root_dse: Mutex::new(Entry::new("")),
            write_lock: Mutex::new(()),
        }
    }

    pub fn in_memory(base_dns: &[String]) -> Self {
        Self::new(Box::new(InMemoryStore::new()), base_dns)
    }

    /// Base DNs as configured.
    pub fn base_dns(&self) -> &[String] {
        &self.naming_contexts
    }

    pub fn set_password_attributes(&mut self, attributes: Vec<String>) {
        self.password_attributes = attributes;
    }

    pub fn password_attributes(&self) -> &[String] {
        &self.password_attributes
    }

    pub fn add_additional_bind_credentials(&mut self, dn: &str, password: impl Into<Vec<u8>>) {
        self.additional_credentials
            .insert(normalize_dn(dn), password.into());
    }

    pub fn set_root_dse(&self, entry: Entry) {
        *self.root_dse.lock() = entry;
    }

    pub fn root_dse(&self) -> Entry {
        self.root_dse.lock().clone()
    }

    pub fn entry_count(&self) -> usize {
        self.store.len()
    }

    pub fn get(&self, dn: &str) -> Option<Entry> {
        if split_dn(dn).is_empty() {
            return Some(self.root_dse());
        }
        self.store.get(dn)
    }

    /// True when `dn` names an existing entry or one of the additional bind identities.
    pub fn identity_exists(&self, dn: &str) -> bool {
        self.additional_credentials.contains_key(&normalize_dn(dn)) || self.store.contains(dn)
    }

    fn require_entry(&self, dn: &str) -> LdapResultOf<Entry> {
        self.store
            .get(dn)
            .ok_or_else(|| LdapError::no_such_object(dn).with_matched_dn(self.matched_dn(dn)))
    }

    /// Closest existing ancestor of `dn`, for the matchedDN of noSuchObject results.
    fn matched_dn(&self, dn: &str) -> String {
        let mut current = parent_dn(dn);
        while let Some(candidate) = current {
            if candidate.is_empty() {
                break;
            }
            if let Some(entry) = self.store.get(&candidate) {
                return entry.dn().to_string();
            }
            current = parent_dn(&candidate);
        }
        String::new()
    }

    fn check_under_base(&self, dn: &str) -> LdapResultOf<()> {
        let normalized = normalize_dn(dn);
        if self.base_dns.iter().any(|base| is_within(&normalized, base)) {
            Ok(())
        } else {
            Err(LdapError::new(
                ResultCode::NO_SUCH_OBJECT,
                format!("'{}' is not within any of the configured base DNs", dn),
            ))
        }
    }

    fn is_base_dn(&self, dn: &str) -> bool {
        let normalized = normalize_dn(dn);
        self.base_dns.iter().any(|base| *base == normalized)
    }

    /// Constant-time check of `password` against the additional credentials
    /// and the entry's password attributes.
    pub fn check_password(&self, dn: &str, password: &[u8]) -> bool {
        if let Some(stored) = self.additional_credentials.get(&normalize_dn(dn)) {
            if bool::from(stored.as_slice().ct_eq(password)) {
                return true;
            }
        }
        let Some(entry) = self.store.get(dn) else {
            return false;
        };
        let mut matched = false;
        for attribute in &self.password_attributes {
            for stored in entry.values(attribute) {
                matched |= bool::from(stored.as_slice().ct_eq(password));
            }
        }
        matched
    }

    /// Resolves a SASL authorization identity (`dn:...`, `u:...`, or a bare
    /// user name) to a DN. The empty `dn:` form is the anonymous identity.
    pub fn resolve_authzid(&self, authzid: &str) -> LdapResultOf<String> {
        if let Some(dn) = authzid.strip_prefix("dn:") {
            let dn = dn.trim();
            if dn.is_empty() || self.identity_exists(dn) {
                return Ok(dn.to_string());
            }
            return Err(LdapError::new(
                ResultCode::INVALID_CREDENTIALS,
                format!("authorization identity '{}' does not exist", authzid),
            ));
        }
        let username = authzid.strip_prefix("u:").unwrap_or(authzid);
        if username.is_empty() {
            return Ok(String::new());
        }
        let filter = Filter::equality("uid", username.as_bytes().to_vec());
        let mut found: Vec<Entry> = self
            .base_dns
            .iter()
            .flat_map(|base| self.store.subtree(base))
            .filter(|e| e.matches(&filter))
            .collect();
        match found.len() {
            1 => Ok(found.remove(0).dn().to_string()),
            0 => Err(LdapError::new(
                ResultCode::INVALID_CREDENTIALS,
                format!("no entry found for user '{}'", username),
            )),
            _ => Err(LdapError::new(
                ResultCode::INVALID_CREDENTIALS,
                format!("user name '{}' matches multiple entries", username),
            )),
        }
    }

    /// Adds `entry`, filling in its RDN values. With `no_op` the checks run
    /// but nothing is stored.
    pub fn add(&self, mut entry: Entry, no_op: bool) -> LdapResultOf<Entry> {
        let _guard = self.write_lock.lock();
        let dn = entry.dn().to_string();
        let rdns = split_dn(&dn);
        let Some(rdn) = rdns.first() else {
            return Err(LdapError::unwilling_to_perform("cannot add the root DSE"));
        };
        let components = rdn_components(rdn);
        if components.is_empty() {
            return Err(LdapError::new(
                ResultCode::INVALID_DN_SYNTAX,
                format!("'{}' is not a valid DN", dn),
            ));
        }
        self.check_under_base(&dn)?;
        if self.store.contains(&dn) {
            return Err(LdapError::new(
                ResultCode::ENTRY_ALREADY_EXISTS,
                format!("entry '{}' already exists", dn),
            ));
        }
        if !self.is_base_dn(&dn) {
            let parent = parent_dn(&dn).unwrap_or_default();
            if !self.store.contains(&parent) {
                return Err(LdapError::new(
                    ResultCode::NO_SUCH_OBJECT,
                    format!("parent entry '{}' does not exist", parent),
                )
                .with_matched_dn(self.matched_dn(&dn)));
            }
        }
        for (name, value) in components {
            entry.add_values(&name, vec![value.into_bytes()], true)?;
        }
        if !no_op {
            debug!(dn = %dn, "adding entry");
            self.store.put(entry.clone());
        }
        Ok(entry)
    }

    /// Deletes a leaf entry, or the whole subtree when `subtree` is set.
    pub fn delete(&self, dn: &str, subtree: bool, no_op: bool) -> LdapResultOf<Entry> {
        let _guard = self.write_lock.lock();
        let entry = self.require_entry(dn)?;
        let below = self.store.subtree(dn);
        if below.len() > 1 && !subtree {
            return Err(LdapError::new(
                ResultCode::NOT_ALLOWED_ON_NONLEAF,
                format!("entry '{}' has subordinate entries", dn),
            ));
        }
        if !no_op {
            debug!(dn = %dn, count = below.len(), "deleting entries");
            for e in below {
                self.store.remove(e.dn());
            }
        }
        Ok(entry)
    }

    /// Applies all modifications atomically. Returns the entry before and after.
    pub fn modify(
        &self,
        dn: &str,
        changes: &[Modification],
        permissive: bool,
        no_op: bool,
    ) -> LdapResultOf<(Entry, Entry)> {
        let _guard = self.write_lock.lock();
        let before = self.require_entry(dn)?;
        let mut after = before.clone();
        for change in changes {
            after.apply_modification(change, permissive)?;
        }
        if let Some(rdn) = split_dn(dn).first() {
            for (name, value) in rdn_components(rdn) {
                if !after.has_value(&name, value.as_bytes()) {
                    return Err(LdapError::new(
                        ResultCode::NOT_ALLOWED_ON_RDN,
                        format!("cannot remove RDN value {}={}", name, value),
                    ));
                }
            }
        }
        if !no_op {
            self.store.put(after.clone());
        }
        Ok((before, after))
    }

    /// Renames and/or moves an entry together with its subordinates.
    pub fn modify_dn(
        &self,
        dn: &str,
        new_rdn: &str,
        delete_old_rdn: bool,
        new_superior: Option<&str>,
        no_op: bool,
    ) -> LdapResultOf<(Entry, Entry)> {
        let _guard = self.write_lock.lock();
        let before = self.require_entry(dn)?;
        let new_components = rdn_components(new_rdn);
        if new_components.is_empty() {
            return Err(LdapError::new(
                ResultCode::INVALID_DN_SYNTAX,
                format!("'{}' is not a valid RDN", new_rdn),
            ));
        }
        let parent = match new_superior {
            Some(superior) => {
                if !superior.is_empty() && !self.store.contains(superior) {
                    return Err(LdapError::new(
                        ResultCode::NO_SUCH_OBJECT,
                        format!("new superior entry '{}' does not exist", superior),
                    ));
                }
                superior.to_string()
            }
            None => parent_dn(dn).unwrap_or_default(),
        };
        let new_dn = if parent.is_empty() {
            new_rdn.trim().to_string()
        } else {
            format!("{},{}", new_rdn.trim(), parent)
        };
        let old_norm = normalize_dn(dn);
        let new_norm = normalize_dn(&new_dn);
        if is_within(&new_norm, &old_norm) && new_norm != old_norm {
            return Err(LdapError::unwilling_to_perform(
                "cannot move an entry below itself",
            ));
        }
        if new_norm != old_norm && self.store.contains(&new_dn) {
            return Err(LdapError::new(
                ResultCode::ENTRY_ALREADY_EXISTS,
                format!("entry '{}' already exists", new_dn),
            ));
        }
        self.check_under_base(&new_dn)?;

        let mut after = before.renamed(new_dn.clone());
        if delete_old_rdn {
            if let Some(old_rdn) = split_dn(dn).first() {
                for (name, value) in rdn_components(old_rdn) {
                    let kept = new_components
                        .iter()
                        .any(|(n, v)| n.eq_ignore_ascii_case(&name) && v.eq_ignore_ascii_case(&value));
                    if !kept {
                        after.remove_values(&name, &[value.into_bytes()], true)?;
                    }
                }
            }
        }
        for (name, value) in new_components {
            after.add_values(&name, vec![value.into_bytes()], true)?;
        }

        if !no_op {
            let subordinates: Vec<Entry> = self
                .store
                .subtree(dn)
                .into_iter()
                .filter(|e| normalize_dn(e.dn()) != old_norm)
                .collect();
            self.store.remove(dn);
            for sub in subordinates {
                self.store.remove(sub.dn());
                let parts = split_dn(sub.dn());
                let depth = parts.len() - split_dn(dn).len();
                let moved = format!("{},{}", parts[..depth].join(","), new_dn);
                self.store.put(sub.renamed(moved));
            }
            debug!(from = %dn, to = %new_dn, "renamed entry");
            self.store.put(after.clone());
        }
        Ok((before, after))
    }

    pub fn compare(&self, dn: &str, attribute: &str, value: &[u8]) -> LdapResultOf<bool> {
        let entry = self
            .get(dn)
            .ok_or_else(|| LdapError::no_such_object(dn).with_matched_dn(self.matched_dn(dn)))?;
        Ok(entry.has_value(attribute, value))
    }

    /// Entries in scope that match `filter`, in DN order.
    pub fn search(&self, base: &str, scope: SearchScope, filter: &Filter) -> LdapResultOf<Vec<Entry>> {
        if split_dn(base).is_empty() && scope == SearchScope::BaseObject {
            let root = self.root_dse();
            return Ok(if root.matches(filter) { vec![root] } else { Vec::new() });
        }
        let base_norm = normalize_dn(base);
        let candidates = if base_norm.is_empty() {
            self.store.subtree("")
        } else {
            self.require_entry(base)?;
            self.store.subtree(base)
        };
        let base_depth = split_dn(base).len();
        let mut results: Vec<Entry> = candidates
            .into_iter()
            .filter(|e| {
                let depth = split_dn(e.dn()).len();
                match scope {
                    SearchScope::BaseObject => depth == base_depth,
                    SearchScope::SingleLevel => depth == base_depth + 1,
                    SearchScope::WholeSubtree => true,
                    SearchScope::Subordinates => depth > base_depth,
                }
            })
            .filter(|e| e.matches(filter))
            .collect();
        results.sort_by_key(|e| {
            let mut parts: Vec<String> = split_dn(e.dn()).iter().map(|p| normalize_rdn(p)).collect();
            parts.reverse();
            parts
        });
        Ok(results)
    }

    /// Replaces the first configured password attribute of `dn`.
    pub fn set_password(&self, dn: &str, password: Vec<u8>) -> LdapResultOf<()> {
        let _guard = self.write_lock.lock();
        let mut entry = self.require_entry(dn)?;
        let attribute = self
            .password_attributes
            .first()
            .cloned()
            .unwrap_or_else(|| "userPassword".to_string());
        entry.replace_values(&attribute, vec![password]);
        self.store.put(entry);
        Ok(())
    }
}
