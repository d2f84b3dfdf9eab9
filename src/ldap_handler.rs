use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::controls::{
    self, AdmittedControls, RequestControl, SortKey, VlvTarget, POST_READ_OID, PRE_READ_OID,
    PROXIED_AUTH_V1_OID, PROXIED_AUTH_V2_OID,
};
use crate::directory::{Directory, Entry};
use crate::error::{LdapError, LdapResultOf};
use crate::extended::{ExtendedContext, ExtendedRegistry};
use crate::ldap_protocol::{
    encode_error_response, AddRequest, Attribute, BindAuthentication, BindRequest, BindResponse,
    CompareRequest, Control, DeleteRequest, ExtendedRequest, LdapMessage, LdapResult,
    ModifyDnRequest, ModifyRequest, OperationType, ProtocolOp, ResultCode, SearchRequest,
};
use crate::metrics::Metrics;
use crate::sasl::{SaslRegistry, SaslState};

/// Server-wide request policy.
#[derive(Debug, Clone)]
pub struct HandlerSettings {
    pub allowed_operation_types: BTreeSet<OperationType>,
    pub authentication_required_operation_types: BTreeSet<OperationType>,
    /// 0 = unlimited.
    pub max_size_limit: usize,
    pub vendor_name: String,
    pub vendor_version: String,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            allowed_operation_types: OperationType::ALL.into_iter().collect(),
            authentication_required_operation_types: BTreeSet::new(),
            max_size_limit: 0,
            vendor_name: env!("CARGO_PKG_NAME").to_string(),
            vendor_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Bind state of one client connection.
#[derive(Debug, Default)]
pub struct ConnectionState {
    authenticated_dn: String,
    sasl_mechanism: Option<String>,
    sasl_state: SaslState,
}

impl ConnectionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty while the connection is anonymous.
    pub fn authenticated_dn(&self) -> &str {
        &self.authenticated_dn
    }

    pub fn is_authenticated(&self) -> bool {
        !self.authenticated_dn.is_empty()
    }
}

/// Decoded request in, responses out. Shared by all connections.
pub struct LdapHandler {
    directory: Arc<Directory>,
    sasl: SaslRegistry,
    extended: ExtendedRegistry,
    settings: HandlerSettings,
    metrics: Arc<Metrics>,
}

impl LdapHandler {
    pub fn new(
        directory: Arc<Directory>,
        sasl: SaslRegistry,
        extended: ExtendedRegistry,
        settings: HandlerSettings,
        metrics: Arc<Metrics>,
    ) -> Self {
        let handler = Self {
            directory,
            sasl,
            extended,
            settings,
            metrics,
        };
        handler.directory.set_root_dse(handler.build_root_dse());
        handler
    }

    pub fn directory(&self) -> &Arc<Directory> {
        &self.directory
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    fn build_root_dse(&self) -> Entry {
        let supported_controls: Vec<&str> = controls::supported_control_oids();
        let extensions = self.extended.supported_oids();
        let mechanisms = self.sasl.mechanisms();
        Entry::from_attributes(
            "",
            vec![
                Attribute::from_strings("objectClass", &["top", "ds-root-dse"]),
                Attribute::new("namingContexts", byte_values(self.directory.base_dns())),
                Attribute::new("supportedControl", byte_values(&supported_controls)),
                Attribute::new("supportedExtension", byte_values(&extensions)),
                Attribute::new("supportedSASLMechanisms", byte_values(&mechanisms)),
                Attribute::from_strings("supportedLDAPVersion", &["3"]),
                Attribute::from_strings("vendorName", &[self.settings.vendor_name.as_str()]),
                Attribute::from_strings("vendorVersion", &[self.settings.vendor_version.as_str()]),
            ],
        )
    }

    /// Processes one request. `Ok` carries the responses to send, in order
    /// (none for abandon and unbind). `Err` means the connection must be
    /// terminated with a notice of disconnection.
    pub fn handle(
        &self,
        conn: &mut ConnectionState,
        message: LdapMessage,
    ) -> LdapResultOf<Vec<LdapMessage>> {
        let start = Instant::now();
        let message_id = message.message_id;
        let Some(operation) = message.protocol_op.operation_type() else {
            return Err(LdapError::protocol_error(format!(
                "message {} carries a response operation (type 0x{:02X})",
                message_id,
                message.protocol_op.tag()
            )));
        };
        debug!(message_id, %operation, "processing request");
        if operation == OperationType::Bind {
            conn.authenticated_dn.clear();
        }

        let responses = match self.admit(conn, operation, &message.controls) {
            Ok(admitted) => self.dispatch(conn, message_id, message.protocol_op, &admitted),
            Err(e) => {
                debug!(message_id, %operation, error = %e, "request rejected before dispatch");
                encode_error_response(message_id, operation, e.to_result())
                    .into_iter()
                    .collect()
            }
        };

        let result_code = responses
            .last()
            .and_then(|m| m.protocol_op.result())
            .map(|r| r.result_code);
        self.metrics
            .observe_request(operation, result_code, start.elapsed());
        Ok(responses)
    }

    /// Operation gating and control admission.
    fn admit(
        &self,
        conn: &ConnectionState,
        operation: OperationType,
        request_controls: &[Control],
    ) -> LdapResultOf<AdmittedControls> {
        if operation != OperationType::Unbind
            && !self.settings.allowed_operation_types.contains(&operation)
        {
            return Err(LdapError::unwilling_to_perform(format!(
                "{} operations are not allowed by this server",
                operation
            )));
        }
        let exempt = matches!(
            operation,
            OperationType::Bind | OperationType::Unbind | OperationType::Abandon
        );
        if !exempt
            && !conn.is_authenticated()
            && self
                .settings
                .authentication_required_operation_types
                .contains(&operation)
        {
            return Err(LdapError::new(
                ResultCode::INSUFFICIENT_ACCESS_RIGHTS,
                format!("{} operations require an authenticated connection", operation),
            ));
        }
        let admitted = controls::admit(operation, request_controls).map_err(|e| {
            warn!(%operation, error = %e, "control admission failed");
            self.metrics.inc_admission_rejection();
            LdapError::from(e)
        })?;
        self.check_proxied_authorization(&admitted)?;
        Ok(admitted)
    }

    fn dispatch(
        &self,
        conn: &mut ConnectionState,
        message_id: i32,
        op: ProtocolOp,
        admitted: &AdmittedControls,
    ) -> Vec<LdapMessage> {
        let reply = |op: ProtocolOp, controls: Vec<Control>| {
            vec![LdapMessage::new(message_id, op).with_controls(controls)]
        };
        let failed = |operation: OperationType, e: LdapError| -> Vec<LdapMessage> {
            debug!(message_id, %operation, error = %e, "operation failed");
            encode_error_response(message_id, operation, e.to_result())
                .into_iter()
                .collect()
        };

        match op {
            ProtocolOp::BindRequest(req) => match self.handle_bind(conn, req, admitted) {
                Ok((response, controls)) => reply(ProtocolOp::BindResponse(response), controls),
                Err(e) => failed(OperationType::Bind, e),
            },
            ProtocolOp::AddRequest(req) => match self.handle_add(req, admitted) {
                Ok((result, controls)) => reply(ProtocolOp::AddResponse(result), controls),
                Err(e) => failed(OperationType::Add, e),
            },
            ProtocolOp::DeleteRequest(req) => match self.handle_delete(req, admitted) {
                Ok((result, controls)) => reply(ProtocolOp::DeleteResponse(result), controls),
                Err(e) => failed(OperationType::Delete, e),
            },
            ProtocolOp::ModifyRequest(req) => match self.handle_modify(req, admitted) {
                Ok((result, controls)) => reply(ProtocolOp::ModifyResponse(result), controls),
                Err(e) => failed(OperationType::Modify, e),
            },
            ProtocolOp::ModifyDnRequest(req) => match self.handle_modify_dn(req, admitted) {
                Ok((result, controls)) => reply(ProtocolOp::ModifyDnResponse(result), controls),
                Err(e) => failed(OperationType::ModifyDn, e),
            },
            ProtocolOp::CompareRequest(req) => match self.handle_compare(req, admitted) {
                Ok(result) => reply(ProtocolOp::CompareResponse(result), Vec::new()),
                Err(e) => failed(OperationType::Compare, e),
            },
            ProtocolOp::SearchRequest(req) => match self.handle_search(message_id, req, admitted) {
                Ok(messages) => messages,
                Err(e) => failed(OperationType::Search, e),
            },
            ProtocolOp::ExtendedRequest(req) => {
                let response = self.handle_extended(conn, &req);
                reply(ProtocolOp::ExtendedResponse(response), Vec::new())
            }
            ProtocolOp::AbandonRequest(id) => {
                // Requests run to completion before the next is read; nothing to cancel.
                debug!(message_id, abandon_id = id, "abandon request ignored");
                Vec::new()
            }
            ProtocolOp::UnbindRequest => {
                debug!(message_id, "unbind request");
                Vec::new()
            }
            other => failed(
                OperationType::Extended,
                LdapError::protocol_error(format!("unexpected operation 0x{:02X}", other.tag())),
            ),
        }
    }

    fn check_proxied_authorization(&self, admitted: &AdmittedControls) -> LdapResultOf<()> {
        let denied = |message: String| LdapError::new(ResultCode::AUTHORIZATION_DENIED, message);
        if let Some(RequestControl::ProxiedAuthV1 { proxy_dn }) = admitted.get(PROXIED_AUTH_V1_OID) {
            if !proxy_dn.is_empty() && !self.directory.identity_exists(proxy_dn) {
                return Err(denied(format!("proxied authorization identity '{}' does not exist", proxy_dn)));
            }
        }
        if let Some(RequestControl::ProxiedAuthV2 { authzid }) = admitted.get(PROXIED_AUTH_V2_OID) {
            self.directory
                .resolve_authzid(authzid)
                .map_err(|e| denied(e.message))?;
        }
        Ok(())
    }

    fn check_assertion(&self, admitted: &AdmittedControls, entry: &Entry) -> LdapResultOf<()> {
        match admitted.assertion() {
            Some(filter) if !entry.matches(filter) => Err(LdapError::new(
                ResultCode::ASSERTION_FAILED,
                format!("entry '{}' does not match the assertion filter {}", entry.dn(), filter),
            )),
            _ => Ok(()),
        }
    }

    fn existing_entry(&self, dn: &str) -> LdapResultOf<Entry> {
        self.directory
            .get(dn)
            .ok_or_else(|| LdapError::no_such_object(dn))
    }

    /// Result for a write that succeeded, honouring the no-op control.
    fn write_result(admitted: &AdmittedControls) -> LdapResult {
        if admitted.is_no_op() {
            LdapResult::new(
                ResultCode::NO_OPERATION,
                "the operation would have succeeded but was not applied",
            )
        } else {
            LdapResult::success()
        }
    }

    pub fn handle_bind(
        &self,
        conn: &mut ConnectionState,
        req: BindRequest,
        admitted: &AdmittedControls,
    ) -> LdapResultOf<(BindResponse, Vec<Control>)> {
        conn.authenticated_dn.clear();
        if req.version != 3 {
            return Err(LdapError::protocol_error(format!(
                "LDAP protocol version {} is not supported",
                req.version
            )));
        }

        let (dn, server_sasl_credentials) = match req.authentication {
            BindAuthentication::Simple(password) => {
                conn.sasl_mechanism = None;
                conn.sasl_state.clear();
                (self.simple_bind(&req.name, &password)?, None)
            }
            BindAuthentication::Sasl {
                mechanism,
                credentials,
            } => {
                let handler = self.sasl.get(&mechanism).ok_or_else(|| {
                    LdapError::new(
                        ResultCode::AUTH_METHOD_NOT_SUPPORTED,
                        format!("SASL mechanism {} is not supported", mechanism),
                    )
                })?;
                if !handler.is_multi_stage() || conn.sasl_mechanism.as_deref() != Some(mechanism.as_str()) {
                    conn.sasl_state.clear();
                }
                conn.sasl_mechanism = Some(mechanism.clone());
                let outcome = handler
                    .process_bind(&self.directory, &req.name, credentials.as_deref(), &mut conn.sasl_state)
                    .map_err(|e| {
                        info!(mechanism = %mechanism, error = %e, "SASL bind failed");
                        LdapError::from(e)
                    })?;
                (outcome.authenticated_dn, outcome.server_sasl_credentials)
            }
        };

        info!(dn = %dn, "BIND successful");
        conn.authenticated_dn = dn;
        let mut response_controls = Vec::new();
        if admitted.wants_authorization_identity() {
            response_controls.push(controls::authorization_identity_response(&conn.authenticated_dn));
        }
        Ok((
            BindResponse {
                result: LdapResult::success(),
                server_sasl_credentials,
            },
            response_controls,
        ))
    }

    fn simple_bind(&self, name: &str, password: &[u8]) -> LdapResultOf<String> {
        match (name.trim().is_empty(), password.is_empty()) {
            (true, true) => Ok(String::new()),
            (true, false) => Err(LdapError::new(ResultCode::INVALID_CREDENTIALS, "")),
            (false, true) => Err(LdapError::unwilling_to_perform(
                "simple binds with a DN and an empty password are not allowed",
            )),
            (false, false) => {
                if self.directory.check_password(name, password) {
                    Ok(name.to_string())
                } else {
                    info!(dn = %name, "simple bind failed");
                    Err(LdapError::new(ResultCode::INVALID_CREDENTIALS, ""))
                }
            }
        }
    }

    pub fn handle_add(
        &self,
        req: AddRequest,
        admitted: &AdmittedControls,
    ) -> LdapResultOf<(LdapResult, Vec<Control>)> {
        debug!("Handling ADD request: dn={}", req.dn);
        let entry = Entry::from_attributes(req.dn, req.attributes);
        self.check_assertion(admitted, &entry)?;
        let added = self.directory.add(entry, admitted.is_no_op())?;

        let mut response_controls = Vec::new();
        if let Some(attributes) = admitted.post_read() {
            response_controls.push(read_entry_control(POST_READ_OID, attributes, &added));
        }
        Ok((Self::write_result(admitted), response_controls))
    }

    pub fn handle_delete(
        &self,
        req: DeleteRequest,
        admitted: &AdmittedControls,
    ) -> LdapResultOf<(LdapResult, Vec<Control>)> {
        debug!("Handling DELETE request: dn={}", req.dn);
        let current = self.existing_entry(&req.dn)?;
        self.check_assertion(admitted, &current)?;
        let removed = self
            .directory
            .delete(&req.dn, admitted.is_subtree_delete(), admitted.is_no_op())?;

        let mut response_controls = Vec::new();
        if let Some(attributes) = admitted.pre_read() {
            response_controls.push(read_entry_control(PRE_READ_OID, attributes, &removed));
        }
        Ok((Self::write_result(admitted), response_controls))
    }

    pub fn handle_modify(
        &self,
        req: ModifyRequest,
        admitted: &AdmittedControls,
    ) -> LdapResultOf<(LdapResult, Vec<Control>)> {
        debug!("Handling MODIFY request: dn={}", req.dn);
        let current = self.existing_entry(&req.dn)?;
        self.check_assertion(admitted, &current)?;
        let (before, after) = self.directory.modify(
            &req.dn,
            &req.changes,
            admitted.is_permissive_modify(),
            admitted.is_no_op(),
        )?;
        Ok((Self::write_result(admitted), read_entry_controls(admitted, &before, &after)))
    }

    pub fn handle_modify_dn(
        &self,
        req: ModifyDnRequest,
        admitted: &AdmittedControls,
    ) -> LdapResultOf<(LdapResult, Vec<Control>)> {
        debug!("Handling MODIFYDN request: dn={}, newrdn={}", req.dn, req.new_rdn);
        let current = self.existing_entry(&req.dn)?;
        self.check_assertion(admitted, &current)?;
        let (before, after) = self.directory.modify_dn(
            &req.dn,
            &req.new_rdn,
            req.delete_old_rdn,
            req.new_superior.as_deref(),
            admitted.is_no_op(),
        )?;
        Ok((Self::write_result(admitted), read_entry_controls(admitted, &before, &after)))
    }

    pub fn handle_compare(
        &self,
        req: CompareRequest,
        admitted: &AdmittedControls,
    ) -> LdapResultOf<LdapResult> {
        debug!("Handling COMPARE request: dn={}, attr={}", req.dn, req.attribute);
        let current = self.existing_entry(&req.dn)?;
        self.check_assertion(admitted, &current)?;
        let matched = self.directory.compare(&req.dn, &req.attribute, &req.value)?;
        let code = if matched {
            ResultCode::COMPARE_TRUE
        } else {
            ResultCode::COMPARE_FALSE
        };
        Ok(LdapResult::new(code, ""))
    }

    pub fn handle_search(
        &self,
        message_id: i32,
        req: SearchRequest,
        admitted: &AdmittedControls,
    ) -> LdapResultOf<Vec<LdapMessage>> {
        debug!(
            "Handling SEARCH request: base={}, scope={:?}, filter={}",
            req.base_dn, req.scope, req.filter
        );
        if admitted.assertion().is_some() {
            let base = self.existing_entry(&req.base_dn)?;
            self.check_assertion(admitted, &base)?;
        }

        let mut entries = self.directory.search(&req.base_dn, req.scope, &req.filter)?;
        let total = entries.len();
        let mut result = LdapResult::success();

        let mut done_controls = Vec::new();
        if let Some(keys) = admitted.sort_keys() {
            sort_entries(&mut entries, keys);
            done_controls.push(controls::server_side_sort_response(ResultCode::SUCCESS.0));
        }
        if let Some((size, cookie)) = admitted.paged_results() {
            let (range, next_cookie) = paged_range(size, cookie, total)?;
            select_range(&mut entries, range);
            done_controls.push(controls::paged_results_response(clamp_i32(total), &next_cookie));
        }
        if let Some((before, after, target)) = admitted.virtual_list_view() {
            let keys = admitted.sort_keys().unwrap_or_default();
            match vlv_range(&entries, keys, before, after, target) {
                Some((position, range)) => {
                    select_range(&mut entries, range);
                    done_controls.push(controls::virtual_list_view_response(
                        clamp_i32(position),
                        clamp_i32(total),
                        ResultCode::SUCCESS.0,
                    ));
                }
                None => {
                    entries.clear();
                    result = LdapResult::new(
                        ResultCode::OFFSET_RANGE_ERROR,
                        "the virtual list view offset must be at least one",
                    );
                    done_controls.push(controls::virtual_list_view_response(
                        0,
                        clamp_i32(total),
                        ResultCode::OFFSET_RANGE_ERROR.0,
                    ));
                }
            }
        }

        let limit = effective_size_limit(req.size_limit, self.settings.max_size_limit);
        if limit > 0 && entries.len() > limit {
            entries.truncate(limit);
            result = LdapResult::new(
                ResultCode::SIZE_LIMIT_EXCEEDED,
                format!("the search matched more than {} entries", limit),
            );
        }
        debug!("SEARCH returned {} of {} entries", entries.len(), total);

        let mut messages: Vec<LdapMessage> = entries
            .iter()
            .map(|entry| {
                LdapMessage::new(
                    message_id,
                    ProtocolOp::SearchResultEntry(entry.to_search_entry(&req.attributes, req.types_only)),
                )
            })
            .collect();
        messages.push(
            LdapMessage::new(message_id, ProtocolOp::SearchResultDone(result)).with_controls(done_controls),
        );
        Ok(messages)
    }

    pub fn handle_extended(
        &self,
        conn: &ConnectionState,
        req: &ExtendedRequest,
    ) -> crate::ldap_protocol::ExtendedResponse {
        debug!("Handling EXTENDED request: oid={}", req.oid);
        let ctx = ExtendedContext {
            directory: &self.directory,
            authenticated_dn: &conn.authenticated_dn,
        };
        self.extended.process(&ctx, req)
    }
}

fn byte_values<S: AsRef<str>>(values: &[S]) -> Vec<Vec<u8>> {
    values.iter().map(|v| v.as_ref().as_bytes().to_vec()).collect()
}

fn read_entry_control(oid: &str, attributes: &[String], entry: &Entry) -> Control {
    controls::read_entry_response(oid, &entry.to_search_entry(attributes, false))
}

fn read_entry_controls(admitted: &AdmittedControls, before: &Entry, after: &Entry) -> Vec<Control> {
    let mut response_controls = Vec::new();
    if let Some(attributes) = admitted.pre_read() {
        response_controls.push(read_entry_control(PRE_READ_OID, attributes, before));
    }
    if let Some(attributes) = admitted.post_read() {
        response_controls.push(read_entry_control(POST_READ_OID, attributes, after));
    }
    response_controls
}

fn effective_size_limit(requested: i32, server_max: usize) -> usize {
    let requested = usize::try_from(requested).unwrap_or(0);
    match (requested, server_max) {
        (0, max) => max,
        (req, 0) => req,
        (req, max) => req.min(max),
    }
}

fn clamp_i32(value: usize) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

/// Lowest value for ascending order, highest for reverse.
fn sort_value(entry: &Entry, key: &SortKey) -> Option<String> {
    let values = entry
        .values(&key.attribute)
        .iter()
        .map(|v| String::from_utf8_lossy(v).to_lowercase());
    if key.reverse {
        values.max()
    } else {
        values.min()
    }
}

fn compare_sort_values(a: &[Option<String>], b: &[Option<String>], keys: &[SortKey]) -> Ordering {
    for ((a, b), key) in a.iter().zip(b).zip(keys) {
        let ordering = match (a, b) {
            (Some(a), Some(b)) if key.reverse => b.cmp(a),
            (Some(a), Some(b)) => a.cmp(b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// Each key breaks ties left by the ones before it. Entries without the
/// attribute of a key go after those with it in either direction.
fn sort_entries(entries: &mut Vec<Entry>, keys: &[SortKey]) {
    let mut keyed: Vec<(Vec<Option<String>>, Entry)> = entries
        .drain(..)
        .map(|entry| (keys.iter().map(|key| sort_value(&entry, key)).collect(), entry))
        .collect();
    keyed.sort_by(|(a, _), (b, _)| compare_sort_values(a, b, keys));
    entries.extend(keyed.into_iter().map(|(_, entry)| entry));
}

fn select_range(entries: &mut Vec<Entry>, range: Range<usize>) {
    entries.truncate(range.end);
    entries.drain(..range.start.min(entries.len()));
}

/// The slice of `total` results one paged request returns and the cookie
/// that resumes after it. The cookie is the decimal offset of the next
/// page and is empty once the results are exhausted. A size of zero ends
/// the paged search.
fn paged_range(size: i32, cookie: &[u8], total: usize) -> LdapResultOf<(Range<usize>, Vec<u8>)> {
    let offset = if cookie.is_empty() {
        0
    } else {
        std::str::from_utf8(cookie)
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| LdapError::unwilling_to_perform("the paged results cookie is not valid"))?
    };
    let offset = offset.min(total);
    let size = usize::try_from(size).unwrap_or(0);
    if size == 0 {
        return Ok((offset..offset, Vec::new()));
    }
    let end = offset.saturating_add(size).min(total);
    let next_cookie = if end < total {
        end.to_string().into_bytes()
    } else {
        Vec::new()
    };
    Ok((offset..end, next_cookie))
}

/// Locates the target of a virtual list view request in the sorted
/// `entries` and returns its 1-based position with the before/after window
/// around it. `None` when the offset is out of range.
fn vlv_range(
    entries: &[Entry],
    keys: &[SortKey],
    before: i32,
    after: i32,
    target: &VlvTarget,
) -> Option<(usize, Range<usize>)> {
    let total = entries.len();
    let index = match target {
        VlvTarget::ByOffset {
            offset,
            content_count,
        } => {
            let offset = usize::try_from(*offset).ok().filter(|o| *o >= 1)?;
            let content_count = usize::try_from(*content_count).ok()?;
            let position = if content_count == 0 || content_count == total {
                offset
            } else {
                // Scale the client's estimate of the list onto its real size.
                let scaled = (offset as u128 * total as u128 + content_count as u128 / 2)
                    / content_count as u128;
                usize::try_from(scaled).unwrap_or(usize::MAX)
            };
            position.clamp(1, total.max(1)) - 1
        }
        VlvTarget::GreaterOrEqual(value) => {
            let key = keys.first()?;
            let value = String::from_utf8_lossy(value).to_lowercase();
            entries
                .iter()
                .position(|entry| match sort_value(entry, key) {
                    Some(v) if key.reverse => v <= value,
                    Some(v) => v >= value,
                    None => true,
                })
                .unwrap_or(total)
        }
    };
    let before = usize::try_from(before).unwrap_or(0);
    let after = usize::try_from(after).unwrap_or(0);
    let end = index.saturating_add(after).saturating_add(1).min(total);
    let start = index.saturating_sub(before).min(end);
    let position = if total == 0 { 0 } else { index + 1 };
    Some((position, start..end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controls::{
        RequestControl, SortKey, VlvTarget, AUTHORIZATION_IDENTITY_RESPONSE_OID,
        SERVER_SIDE_SORT_RESPONSE_OID, SIMPLE_PAGED_RESULTS_OID, VIRTUAL_LIST_VIEW_RESPONSE_OID,
    };
    use crate::ldap_protocol::{Filter, Modification, ModificationType, SearchScope};

    const BASE: &str = "dc=example,dc=com";
    const JDOE: &str = "uid=jdoe,ou=people,dc=example,dc=com";

    fn handler_with(settings: HandlerSettings) -> LdapHandler {
        let mut directory = Directory::in_memory(&[BASE.to_string()]);
        directory.add_additional_bind_credentials("cn=Directory Manager", "password");
        let entries = vec![
            Entry::from_attributes(BASE, vec![Attribute::from_strings("objectClass", &["domain"])]),
            Entry::from_attributes(
                "ou=people,dc=example,dc=com",
                vec![Attribute::from_strings("objectClass", &["organizationalUnit"])],
            ),
            Entry::from_attributes(
                JDOE,
                vec![
                    Attribute::from_strings("objectClass", &["person"]),
                    Attribute::from_strings("cn", &["John Doe"]),
                    Attribute::from_strings("sn", &["Doe"]),
                    Attribute::from_strings("userPassword", &["secret"]),
                ],
            ),
            Entry::from_attributes(
                "uid=asmith,ou=people,dc=example,dc=com",
                vec![
                    Attribute::from_strings("objectClass", &["person"]),
                    Attribute::from_strings("cn", &["Alice Smith"]),
                    Attribute::from_strings("sn", &["Smith"]),
                ],
            ),
        ];
        for entry in entries {
            directory.add(entry, false).unwrap();
        }
        LdapHandler::new(
            Arc::new(directory),
            SaslRegistry::with_mechanisms(&["PLAIN".to_string()], true),
            ExtendedRegistry::with_defaults(),
            settings,
            Arc::new(Metrics::new()),
        )
    }

    fn handler() -> LdapHandler {
        handler_with(HandlerSettings::default())
    }

    fn send(handler: &LdapHandler, conn: &mut ConnectionState, op: ProtocolOp, controls: Vec<Control>) -> Vec<LdapMessage> {
        handler
            .handle(conn, LdapMessage::new(7, op).with_controls(controls))
            .unwrap()
    }

    fn code(messages: &[LdapMessage]) -> ResultCode {
        messages.last().unwrap().protocol_op.result().unwrap().result_code
    }

    fn modify_sn(value: &str) -> ProtocolOp {
        ProtocolOp::ModifyRequest(ModifyRequest {
            dn: JDOE.to_string(),
            changes: vec![Modification {
                operation: ModificationType::Replace,
                attribute: Attribute::from_strings("sn", &[value]),
            }],
        })
    }

    fn search(filter: Filter) -> ProtocolOp {
        ProtocolOp::SearchRequest(SearchRequest::new(BASE, SearchScope::WholeSubtree, filter))
    }

    #[test]
    fn test_simple_bind() {
        let h = handler();
        let mut conn = ConnectionState::new();
        let ok = send(&h, &mut conn, ProtocolOp::BindRequest(BindRequest::simple(JDOE, "secret")), vec![]);
        assert_eq!(code(&ok), ResultCode::SUCCESS);
        assert_eq!(conn.authenticated_dn(), JDOE);

        let bad = send(&h, &mut conn, ProtocolOp::BindRequest(BindRequest::simple(JDOE, "wrong")), vec![]);
        assert_eq!(code(&bad), ResultCode::INVALID_CREDENTIALS);
        assert!(!conn.is_authenticated(), "a failed bind leaves the connection anonymous");

        let anonymous = send(&h, &mut conn, ProtocolOp::BindRequest(BindRequest::simple("", "")), vec![]);
        assert_eq!(code(&anonymous), ResultCode::SUCCESS);

        let manager = send(
            &h,
            &mut conn,
            ProtocolOp::BindRequest(BindRequest::simple("cn=Directory Manager", "password")),
            vec![],
        );
        assert_eq!(code(&manager), ResultCode::SUCCESS);
    }

    #[test]
    fn test_sasl_plain_with_authorization_identity() {
        let h = handler();
        let mut conn = ConnectionState::new();
        let request = ProtocolOp::BindRequest(BindRequest::sasl("PLAIN", Some(b"\x00jdoe\x00secret".to_vec())));
        let controls = vec![RequestControl::AuthorizationIdentity.to_control(false)];
        let responses = send(&h, &mut conn, request, controls);
        assert_eq!(code(&responses), ResultCode::SUCCESS);
        assert_eq!(conn.authenticated_dn(), JDOE);
        let control = &responses[0].controls[0];
        assert_eq!(control.oid, AUTHORIZATION_IDENTITY_RESPONSE_OID);
        assert_eq!(control.value, Some(format!("dn:{}", JDOE).into_bytes()));

        let unknown = send(&h, &mut conn, ProtocolOp::BindRequest(BindRequest::sasl("CRAM-MD5", None)), vec![]);
        assert_eq!(code(&unknown), ResultCode::AUTH_METHOD_NOT_SUPPORTED);
        assert!(!conn.is_authenticated());
    }

    #[test]
    fn test_operation_gating() {
        let mut settings = HandlerSettings::default();
        settings.allowed_operation_types.remove(&OperationType::Delete);
        settings
            .authentication_required_operation_types
            .insert(OperationType::Search);
        let h = handler_with(settings);
        let mut conn = ConnectionState::new();

        let delete = send(&h, &mut conn, ProtocolOp::DeleteRequest(DeleteRequest { dn: JDOE.into() }), vec![]);
        assert_eq!(code(&delete), ResultCode::UNWILLING_TO_PERFORM);

        let anonymous = send(&h, &mut conn, search(Filter::match_all()), vec![]);
        assert_eq!(code(&anonymous), ResultCode::INSUFFICIENT_ACCESS_RIGHTS);

        send(&h, &mut conn, ProtocolOp::BindRequest(BindRequest::simple(JDOE, "secret")), vec![]);
        let bound = send(&h, &mut conn, search(Filter::match_all()), vec![]);
        assert_eq!(code(&bound), ResultCode::SUCCESS);
    }

    #[test]
    fn test_admission_errors_reach_client() {
        let h = handler();
        let mut conn = ConnectionState::new();
        let vlv = RequestControl::VirtualListView {
            before_count: 0,
            after_count: 10,
            target: VlvTarget::ByOffset {
                offset: 1,
                content_count: 0,
            },
            context_id: None,
        };
        let responses = send(&h, &mut conn, search(Filter::match_all()), vec![vlv.to_control(true)]);
        assert_eq!(responses.len(), 1);
        assert_eq!(code(&responses), ResultCode::SORT_CONTROL_MISSING);

        let critical_unknown = Control::new("1.2.3.4.5", true, None);
        let responses = send(&h, &mut conn, modify_sn("x"), vec![critical_unknown]);
        assert_eq!(code(&responses), ResultCode::UNAVAILABLE_CRITICAL_EXTENSION);
    }

    #[test]
    fn test_assertion_and_no_op() {
        let h = handler();
        let mut conn = ConnectionState::new();
        let failing = RequestControl::Assertion(Filter::equality("sn", "Nobody")).to_control(true);
        assert_eq!(code(&send(&h, &mut conn, modify_sn("x"), vec![failing])), ResultCode::ASSERTION_FAILED);

        let no_op = RequestControl::NoOp.to_control(true);
        assert_eq!(code(&send(&h, &mut conn, modify_sn("x"), vec![no_op])), ResultCode::NO_OPERATION);
        assert!(h.directory().get(JDOE).unwrap().has_value("sn", b"Doe"));

        let passing = RequestControl::Assertion(Filter::equality("sn", "Doe")).to_control(true);
        assert_eq!(code(&send(&h, &mut conn, modify_sn("Roe"), vec![passing])), ResultCode::SUCCESS);
        assert!(h.directory().get(JDOE).unwrap().has_value("sn", b"Roe"));
    }

    #[test]
    fn test_pre_and_post_read() {
        let h = handler();
        let mut conn = ConnectionState::new();
        let controls = vec![
            RequestControl::PreRead(vec!["sn".into()]).to_control(false),
            RequestControl::PostRead(vec!["sn".into()]).to_control(false),
        ];
        let responses = send(&h, &mut conn, modify_sn("Roe"), controls);
        assert_eq!(code(&responses), ResultCode::SUCCESS);
        let by_oid = |oid: &str| {
            let control = responses[0].controls.iter().find(|c| c.oid == oid).unwrap();
            let mut reader = crate::ber::Asn1StreamReader::new(control.value.as_deref().unwrap());
            crate::ldap_protocol::SearchResultEntry::read_from(&mut reader).unwrap()
        };
        assert_eq!(by_oid(PRE_READ_OID).attribute("sn").unwrap().values, vec![b"Doe".to_vec()]);
        assert_eq!(by_oid(POST_READ_OID).attribute("sn").unwrap().values, vec![b"Roe".to_vec()]);
    }

    #[test]
    fn test_subtree_delete() {
        let h = handler();
        let mut conn = ConnectionState::new();
        let delete = || ProtocolOp::DeleteRequest(DeleteRequest { dn: "ou=people,dc=example,dc=com".into() });
        assert_eq!(code(&send(&h, &mut conn, delete(), vec![])), ResultCode::NOT_ALLOWED_ON_NONLEAF);
        let subtree = RequestControl::SubtreeDelete.to_control(true);
        assert_eq!(code(&send(&h, &mut conn, delete(), vec![subtree])), ResultCode::SUCCESS);
        assert!(h.directory().get(JDOE).is_none());
    }

    fn entry_dns(messages: &[LdapMessage]) -> Vec<&str> {
        messages
            .iter()
            .filter_map(|m| match &m.protocol_op {
                ProtocolOp::SearchResultEntry(e) => Some(e.dn.as_str()),
                _ => None,
            })
            .collect()
    }

    fn done_control_values(
        messages: &[LdapMessage],
        oid: &str,
    ) -> crate::ber::Asn1StreamReader<std::io::Cursor<Vec<u8>>> {
        let control = messages
            .last()
            .unwrap()
            .controls
            .iter()
            .find(|c| c.oid == oid)
            .unwrap();
        let mut reader = crate::ber::Asn1StreamReader::new(std::io::Cursor::new(control.value.clone().unwrap()));
        reader.begin_required_sequence().unwrap();
        reader
    }

    fn sort_by(keys: &[(&str, bool)]) -> Control {
        let keys = keys
            .iter()
            .map(|(attribute, reverse)| SortKey {
                attribute: attribute.to_string(),
                ordering_rule: None,
                reverse: *reverse,
            })
            .collect();
        RequestControl::ServerSideSort(keys).to_control(true)
    }

    #[test]
    fn test_paged_search_walks_pages_with_cookie() {
        let h = handler();
        let mut conn = ConnectionState::new();
        let people = || search(Filter::equality("objectClass", "person"));
        let page = |cookie: Vec<u8>| RequestControl::SimplePagedResults { size: 1, cookie }.to_control(true);

        let first = send(&h, &mut conn, people(), vec![sort_by(&[("sn", false)]), page(Vec::new())]);
        assert_eq!(code(&first), ResultCode::SUCCESS);
        assert_eq!(entry_dns(&first), vec![JDOE]);
        let mut paged = done_control_values(&first, SIMPLE_PAGED_RESULTS_OID);
        assert_eq!(paged.read_integer().unwrap(), 2);
        let cookie = paged.read_bytes().unwrap();
        assert!(!cookie.is_empty());

        let second = send(&h, &mut conn, people(), vec![sort_by(&[("sn", false)]), page(cookie)]);
        assert_eq!(entry_dns(&second), vec!["uid=asmith,ou=people,dc=example,dc=com"]);
        let mut paged = done_control_values(&second, SIMPLE_PAGED_RESULTS_OID);
        assert_eq!(paged.read_integer().unwrap(), 2);
        assert!(paged.read_bytes().unwrap().is_empty());

        let bogus = send(&h, &mut conn, people(), vec![page(b"not-a-cookie".to_vec())]);
        assert_eq!(code(&bogus), ResultCode::UNWILLING_TO_PERFORM);
        assert!(entry_dns(&bogus).is_empty());
    }

    #[test]
    fn test_sort_keys_break_ties_in_order() {
        let h = handler();
        h.directory()
            .add(
                Entry::from_attributes(
                    "uid=bdoe,ou=people,dc=example,dc=com",
                    vec![
                        Attribute::from_strings("objectClass", &["person"]),
                        Attribute::from_strings("cn", &["Bob Doe"]),
                        Attribute::from_strings("sn", &["Doe"]),
                    ],
                ),
                false,
            )
            .unwrap();
        let mut conn = ConnectionState::new();
        let people = || search(Filter::equality("objectClass", "person"));

        let ascending = send(&h, &mut conn, people(), vec![sort_by(&[("sn", false), ("cn", false)])]);
        assert_eq!(
            entry_dns(&ascending),
            vec![
                "uid=bdoe,ou=people,dc=example,dc=com",
                JDOE,
                "uid=asmith,ou=people,dc=example,dc=com"
            ]
        );
        let descending = send(&h, &mut conn, people(), vec![sort_by(&[("sn", false), ("cn", true)])]);
        assert_eq!(
            entry_dns(&descending),
            vec![
                JDOE,
                "uid=bdoe,ou=people,dc=example,dc=com",
                "uid=asmith,ou=people,dc=example,dc=com"
            ]
        );
        let done = descending.last().unwrap();
        assert!(done.controls.iter().any(|c| c.oid == SERVER_SIDE_SORT_RESPONSE_OID));
    }

    #[test]
    fn test_virtual_list_view_window() {
        let h = handler();
        let mut conn = ConnectionState::new();
        let vlv = |before_count, after_count, target| {
            RequestControl::VirtualListView {
                before_count,
                after_count,
                target,
                context_id: None,
            }
            .to_control(true)
        };
        let by_offset = |offset| VlvTarget::ByOffset {
            offset,
            content_count: 0,
        };

        // Sorted by sn: Doe, Smith, then the two entries without sn.
        let first_two = send(
            &h,
            &mut conn,
            search(Filter::match_all()),
            vec![sort_by(&[("sn", false)]), vlv(0, 1, by_offset(1))],
        );
        assert_eq!(code(&first_two), ResultCode::SUCCESS);
        assert_eq!(entry_dns(&first_two), vec![JDOE, "uid=asmith,ou=people,dc=example,dc=com"]);
        let mut response = done_control_values(&first_two, VIRTUAL_LIST_VIEW_RESPONSE_OID);
        assert_eq!(response.read_integer().unwrap(), 1);
        assert_eq!(response.read_integer().unwrap(), 4);
        assert_eq!(response.read_enumerated().unwrap(), 0);

        let around_smith = send(
            &h,
            &mut conn,
            search(Filter::match_all()),
            vec![
                sort_by(&[("sn", false)]),
                vlv(1, 0, VlvTarget::GreaterOrEqual(b"S".to_vec())),
            ],
        );
        assert_eq!(entry_dns(&around_smith), vec![JDOE, "uid=asmith,ou=people,dc=example,dc=com"]);
        let mut response = done_control_values(&around_smith, VIRTUAL_LIST_VIEW_RESPONSE_OID);
        assert_eq!(response.read_integer().unwrap(), 2);

        let out_of_range = send(
            &h,
            &mut conn,
            search(Filter::match_all()),
            vec![sort_by(&[("sn", false)]), vlv(0, 1, by_offset(0))],
        );
        assert_eq!(code(&out_of_range), ResultCode::OFFSET_RANGE_ERROR);
        assert!(entry_dns(&out_of_range).is_empty());
    }

    #[test]
    fn test_size_limit() {
        let h = handler();
        let mut conn = ConnectionState::new();
        let mut limited = SearchRequest::new(BASE, SearchScope::WholeSubtree, Filter::match_all());
        limited.size_limit = 2;
        let responses = send(&h, &mut conn, ProtocolOp::SearchRequest(limited), vec![]);
        assert_eq!(responses.len(), 3);
        assert_eq!(code(&responses), ResultCode::SIZE_LIMIT_EXCEEDED);
    }

    #[test]
    fn test_paged_and_vlv_ranges() {
        assert_eq!(paged_range(2, b"", 5).unwrap(), (0..2, b"2".to_vec()));
        assert_eq!(paged_range(2, b"4", 5).unwrap(), (4..5, Vec::new()));
        assert_eq!(paged_range(0, b"2", 5).unwrap(), (2..2, Vec::new()));
        assert_eq!(paged_range(3, b"9", 5).unwrap(), (5..5, Vec::new()));
        assert!(paged_range(3, b"x", 5).is_err());

        let entries: Vec<Entry> = (0..10)
            .map(|i| Entry::new(format!("uid=u{},dc=example,dc=com", i)))
            .collect();
        let offset = |offset, content_count| VlvTarget::ByOffset {
            offset,
            content_count,
        };
        assert_eq!(vlv_range(&entries, &[], 2, 2, &offset(5, 0)), Some((5, 2..7)));
        assert_eq!(vlv_range(&entries, &[], 0, 0, &offset(50, 0)), Some((10, 9..10)));
        // Halfway through the client's view is halfway through ours.
        assert_eq!(vlv_range(&entries, &[], 0, 0, &offset(50, 100)), Some((5, 4..5)));
        assert_eq!(vlv_range(&entries, &[], 0, 0, &offset(0, 0)), None);
        assert_eq!(vlv_range(&[], &[], 1, 1, &offset(1, 0)), Some((0, 0..0)));
    }

    #[test]
    fn test_bind_rejected_at_admission_drops_identity() {
        let h = handler();
        let mut conn = ConnectionState::new();
        send(&h, &mut conn, ProtocolOp::BindRequest(BindRequest::simple(JDOE, "secret")), vec![]);
        assert!(conn.is_authenticated());

        let critical_unknown = Control::new("1.2.3.4.5", true, None);
        let rejected = send(
            &h,
            &mut conn,
            ProtocolOp::BindRequest(BindRequest::simple(JDOE, "secret")),
            vec![critical_unknown],
        );
        assert_eq!(code(&rejected), ResultCode::UNAVAILABLE_CRITICAL_EXTENSION);
        assert!(!conn.is_authenticated());
    }

    #[test]
    fn test_root_dse() {
        let h = handler();
        let mut conn = ConnectionState::new();
        let request = SearchRequest::new("", SearchScope::BaseObject, Filter::present("objectClass"));
        let responses = send(&h, &mut conn, ProtocolOp::SearchRequest(request), vec![]);
        let ProtocolOp::SearchResultEntry(root) = &responses[0].protocol_op else {
            panic!("expected the root DSE");
        };
        let naming = root.attribute("namingContexts").unwrap();
        assert_eq!(naming.values, vec![BASE.as_bytes().to_vec()]);
        let mechanisms = root.attribute("supportedSASLMechanisms").unwrap();
        assert_eq!(mechanisms.values, vec![b"PLAIN".to_vec()]);
    }

    #[test]
    fn test_compare_and_who_am_i() {
        let h = handler();
        let mut conn = ConnectionState::new();
        let compare = |value: &str| {
            ProtocolOp::CompareRequest(CompareRequest {
                dn: JDOE.into(),
                attribute: "cn".into(),
                value: value.as_bytes().to_vec(),
            })
        };
        assert_eq!(code(&send(&h, &mut conn, compare("john doe"), vec![])), ResultCode::COMPARE_TRUE);
        assert_eq!(code(&send(&h, &mut conn, compare("nobody"), vec![])), ResultCode::COMPARE_FALSE);

        send(&h, &mut conn, ProtocolOp::BindRequest(BindRequest::simple(JDOE, "secret")), vec![]);
        let who = send(
            &h,
            &mut conn,
            ProtocolOp::ExtendedRequest(ExtendedRequest::new(crate::extended::WHO_AM_I_OID, None)),
            vec![],
        );
        let ProtocolOp::ExtendedResponse(response) = &who[0].protocol_op else {
            panic!("expected an extended response");
        };
        assert_eq!(response.value, Some(format!("dn:{}", JDOE).into_bytes()));
    }

    #[test]
    fn test_response_operation_from_client_disconnects() {
        let h = handler();
        let mut conn = ConnectionState::new();
        let err = h
            .handle(&mut conn, LdapMessage::new(1, ProtocolOp::AddResponse(LdapResult::success())))
            .unwrap_err();
        assert_eq!(err.result_code, ResultCode::PROTOCOL_ERROR);
    }

    #[test]
    fn test_abandon_and_unbind_have_no_response() {
        let h = handler();
        let mut conn = ConnectionState::new();
        assert!(send(&h, &mut conn, ProtocolOp::AbandonRequest(3), vec![]).is_empty());
        assert!(send(&h, &mut conn, ProtocolOp::UnbindRequest, vec![]).is_empty());
        assert_eq!(h.metrics().requests(OperationType::Unbind), 1);
    }

    #[test]
    fn test_effective_size_limit() {
        assert_eq!(effective_size_limit(0, 0), 0);
        assert_eq!(effective_size_limit(5, 0), 5);
        assert_eq!(effective_size_limit(0, 3), 3);
        assert_eq!(effective_size_limit(5, 3), 3);
        assert_eq!(effective_size_limit(-1, 0), 0);
    }
}
