//! In-memory request service used by the engine tests.
//!
//! Reproduces the per-call contracts the engines rely on: falsy envelopes on
//! refused mutations, deletes refused while an enabled chain or a successor
//! stage still references the request, rewind/reserve/flow on chains, the
//! approval state machine and pending invalidation records.
use super::{Envelope, ObjectGateway, ObjectKind};
use crate::model::{ChainedCampaign, ChainedRequest, Request};
use crate::resubmit::ILLEGAL_APPROVAL_STEP_5;
use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};

/// Approval ladder walked by `approve()`; `submit/done` is terminal.
const LADDER: [(&str, &str); 5] = [
    ("none", "new"),
    ("validation", "validation"),
    ("define", "defined"),
    ("approve", "approved"),
    ("submit", "submitted"),
];

#[derive(Default)]
struct State {
    collections: BTreeMap<ObjectKind, BTreeMap<String, Value>>,
    calls: Vec<String>,
    failures: BTreeSet<(String, String)>,
    submit_race: bool,
    counter: u32,
}

#[derive(Default)]
pub struct MemoryGateway {
    state: RefCell<State>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, kind: ObjectKind, record: Value) {
        let prepid = record["prepid"].as_str().unwrap_or_default().to_string();
        self.state
            .borrow_mut()
            .collections
            .entry(kind)
            .or_default()
            .insert(prepid, record);
    }

    pub fn record(&self, kind: ObjectKind, prepid: &str) -> Option<Value> {
        self.state
            .borrow()
            .collections
            .get(&kind)
            .and_then(|records| records.get(prepid))
            .cloned()
    }

    pub fn request(&self, prepid: &str) -> Request {
        let raw = self
            .record(ObjectKind::Requests, prepid)
            .unwrap_or_else(|| panic!("request {prepid} missing"));
        serde_json::from_value(raw).expect("decode request")
    }

    pub fn chain(&self, prepid: &str) -> ChainedRequest {
        let raw = self
            .record(ObjectKind::ChainedRequests, prepid)
            .unwrap_or_else(|| panic!("chain {prepid} missing"));
        serde_json::from_value(raw).expect("decode chain")
    }

    pub fn exists(&self, kind: ObjectKind, prepid: &str) -> bool {
        self.record(kind, prepid).is_some()
    }

    /// Copy of every stored record, for before/after comparisons.
    pub fn snapshot(&self) -> BTreeMap<ObjectKind, BTreeMap<String, Value>> {
        self.state.borrow().collections.clone()
    }

    /// Every call made so far, as `"<operation> <kind> <prepid>"` lines.
    pub fn calls(&self) -> Vec<String> {
        self.state.borrow().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.borrow_mut().calls.clear();
    }

    /// Make the next `operation` on `prepid` answer with a falsy envelope.
    pub fn fail_on(&self, operation: &str, prepid: &str) {
        self.state
            .borrow_mut()
            .failures
            .insert((operation.to_string(), prepid.to_string()));
    }

    /// Emulate a concurrent operator submitting the root first: the
    /// transition happens but the call reports an illegal step.
    pub fn set_submit_race(&self, enabled: bool) {
        self.state.borrow_mut().submit_race = enabled;
    }

    pub fn pending_invalidations(&self) -> Vec<String> {
        self.state
            .borrow()
            .collections
            .get(&ObjectKind::Invalidations)
            .map(|records| {
                records
                    .values()
                    .filter(|record| record["status"] == "new")
                    .filter_map(|record| record["prepid"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn announced_invalidations(&self) -> Vec<String> {
        self.state
            .borrow()
            .collections
            .get(&ObjectKind::Invalidations)
            .map(|records| {
                records
                    .values()
                    .filter(|record| record["status"] == "announced")
                    .filter_map(|record| record["prepid"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn log(&self, operation: &str, kind: ObjectKind, prepid: &str) -> bool {
        let mut state = self.state.borrow_mut();
        state.calls.push(format!("{operation} {kind} {prepid}"));
        state
            .failures
            .remove(&(operation.to_string(), prepid.to_string()))
    }

    fn records_of(&self, kind: ObjectKind) -> Vec<Value> {
        self.state
            .borrow()
            .collections
            .get(&kind)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default()
    }

    fn store(&self, kind: ObjectKind, prepid: &str, record: Value) {
        self.state
            .borrow_mut()
            .collections
            .entry(kind)
            .or_default()
            .insert(prepid.to_string(), record);
    }

    fn remove(&self, kind: ObjectKind, prepid: &str) -> Option<Value> {
        self.state
            .borrow_mut()
            .collections
            .get_mut(&kind)
            .and_then(|records| records.remove(prepid))
    }

    fn next_number(&self) -> u32 {
        let mut state = self.state.borrow_mut();
        state.counter += 1;
        state.counter
    }

    /// Reset a request to the start of the ladder; a done request leaves a
    /// pending invalidation behind.
    fn rewind_request(&self, prepid: &str, clear_validation: bool) {
        let Some(mut record) = self.record(ObjectKind::Requests, prepid) else {
            return;
        };
        if record["status"] == "done" {
            let number = self.next_number();
            let id = format!("inv-{number:04}");
            self.store(
                ObjectKind::Invalidations,
                &id,
                json!({"_id": id.clone(), "prepid": prepid, "status": "new", "type": "dataset"}),
            );
        }
        record["approval"] = json!("none");
        record["status"] = json!("new");
        if clear_validation {
            record["validation"] = json!({});
        }
        self.store(ObjectKind::Requests, prepid, record);
    }

    fn chains_holding(&self, prepid: &str) -> Vec<ChainedRequest> {
        self.records_of(ObjectKind::ChainedRequests)
            .into_iter()
            .filter_map(|raw| serde_json::from_value::<ChainedRequest>(raw).ok())
            .filter(|chain| chain.chain.iter().any(|id| id == prepid))
            .collect()
    }

    fn delete_request(&self, prepid: &str) -> Envelope {
        if !self.exists(ObjectKind::Requests, prepid) {
            return Envelope::failure(format!("{prepid} does not exist"));
        }
        if self
            .chains_holding(prepid)
            .iter()
            .any(|chain| chain.action_parameters.flag)
        {
            return Envelope::failure(format!("{prepid} belongs to an enabled chain"));
        }
        let used_as_input = self
            .records_of(ObjectKind::Requests)
            .iter()
            .any(|record| record["input_from"] == prepid);
        if used_as_input {
            return Envelope::failure(format!("{prepid} is the input of another request"));
        }
        self.remove(ObjectKind::Requests, prepid);
        for mut chain in self.chains_holding(prepid) {
            chain.chain.retain(|id| id != prepid);
            chain.step = chain.step.min(chain.chain.len().saturating_sub(1));
            self.store(
                ObjectKind::ChainedRequests,
                &chain.prepid.clone(),
                serde_json::to_value(&chain).expect("encode chain"),
            );
        }
        Envelope::success()
    }

    fn delete_chain(&self, prepid: &str) -> Envelope {
        if self.remove(ObjectKind::ChainedRequests, prepid).is_none() {
            return Envelope::failure(format!("{prepid} does not exist"));
        }
        for raw in self.records_of(ObjectKind::Requests) {
            let mut request: Request = serde_json::from_value(raw).expect("decode request");
            if request.member_of_chain.iter().any(|id| id == prepid) {
                request.member_of_chain.retain(|id| id != prepid);
                self.store(
                    ObjectKind::Requests,
                    &request.prepid.clone(),
                    serde_json::to_value(&request).expect("encode request"),
                );
            }
        }
        Envelope::success()
    }

    fn approve_request(&self, prepid: &str) -> Envelope {
        let Some(mut record) = self.record(ObjectKind::Requests, prepid) else {
            return Envelope::failure(format!("{prepid} does not exist"));
        };
        let current = (
            record["approval"].as_str().unwrap_or("none").to_string(),
            record["status"].as_str().unwrap_or("new").to_string(),
        );
        let position = LADDER
            .iter()
            .position(|(approval, status)| *approval == current.0 && *status == current.1);
        let Some(position) = position.filter(|index| index + 1 < LADDER.len()) else {
            return Envelope::failure(ILLEGAL_APPROVAL_STEP_5);
        };
        let (approval, status) = LADDER[position + 1];
        record["approval"] = json!(approval);
        record["status"] = json!(status);
        self.store(ObjectKind::Requests, prepid, record);
        if approval == "submit" && self.state.borrow().submit_race {
            return Envelope::failure(ILLEGAL_APPROVAL_STEP_5);
        }
        Envelope::success()
    }

    fn matches(record: &Value, query: &str) -> bool {
        query.split('&').filter(|term| !term.is_empty()).all(|term| {
            let (key, expected) = term.split_once('=').unwrap_or((term, ""));
            let key = if key == "contains" { "chain" } else { key };
            match &record[key] {
                Value::Array(items) => items.iter().any(|item| item == expected),
                Value::String(text) => glob_match(expected, text),
                _ => false,
            }
        })
    }
}

fn glob_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }
    let mut rest = text;
    for (index, part) in parts.iter().enumerate() {
        if index == 0 {
            let Some(stripped) = rest.strip_prefix(part) else {
                return false;
            };
            rest = stripped;
        } else if index == parts.len() - 1 {
            return rest.ends_with(part);
        } else if let Some(found) = rest.find(part) {
            rest = &rest[found + part.len()..];
        } else {
            return false;
        }
    }
    true
}

impl ObjectGateway for MemoryGateway {
    fn get(&self, kind: ObjectKind, prepid: &str) -> Result<Option<Value>> {
        if self.log("get", kind, prepid) {
            return Err(anyhow!("GET {kind} {prepid}: connection reset"));
        }
        Ok(self.record(kind, prepid))
    }

    fn search(&self, kind: ObjectKind, query: &str) -> Result<Vec<Value>> {
        self.log("search", kind, query);
        Ok(self
            .records_of(kind)
            .into_iter()
            .filter(|record| Self::matches(record, query))
            .collect())
    }

    fn put(&self, kind: ObjectKind, method: &str, body: &Value) -> Result<Envelope> {
        let subject = body["prepid"].as_str().unwrap_or(method).to_string();
        if self.log(method, kind, &subject) {
            return Ok(Envelope::failure("injected failure"));
        }
        match (kind, method) {
            (ObjectKind::Invalidations, "announce") => {
                let ids: Vec<&str> = body
                    .as_array()
                    .map(|ids| ids.iter().filter_map(Value::as_str).collect())
                    .unwrap_or_default();
                if ids.is_empty() {
                    return Ok(Envelope::failure("nothing to announce"));
                }
                for id in ids {
                    let Some(mut record) = self.record(ObjectKind::Invalidations, id) else {
                        return Ok(Envelope::failure(format!("unknown invalidation {id}")));
                    };
                    record["status"] = json!("announced");
                    self.store(ObjectKind::Invalidations, id, record);
                }
                Ok(Envelope::success())
            }
            (_, "update") => {
                if !self.exists(kind, &subject) {
                    return Ok(Envelope::failure(format!("{subject} does not exist")));
                }
                self.store(kind, &subject, body.clone());
                Ok(Envelope::success())
            }
            _ => Ok(Envelope::failure(format!("unsupported method {method}"))),
        }
    }

    fn delete(&self, kind: ObjectKind, prepid: &str) -> Result<Envelope> {
        if self.log("delete", kind, prepid) {
            return Ok(Envelope::failure("injected failure"));
        }
        Ok(match kind {
            ObjectKind::Requests => self.delete_request(prepid),
            ObjectKind::ChainedRequests => self.delete_chain(prepid),
            _ => match self.remove(kind, prepid) {
                Some(_) => Envelope::success(),
                None => Envelope::failure(format!("{prepid} does not exist")),
            },
        })
    }

    fn approve(&self, kind: ObjectKind, prepid: &str) -> Result<Envelope> {
        if self.log("approve", kind, prepid) {
            return Ok(Envelope::failure("injected failure"));
        }
        if kind != ObjectKind::Requests {
            return Ok(Envelope::failure("only requests are approved here"));
        }
        Ok(self.approve_request(prepid))
    }

    fn reset(&self, prepid: &str) -> Result<Envelope> {
        if self.log("reset", ObjectKind::Requests, prepid) {
            return Ok(Envelope::failure("injected failure"));
        }
        if !self.exists(ObjectKind::Requests, prepid) {
            return Ok(Envelope::failure(format!("{prepid} does not exist")));
        }
        self.rewind_request(prepid, true);
        Ok(Envelope::success())
    }

    fn soft_reset(&self, prepid: &str) -> Result<Envelope> {
        if self.log("soft_reset", ObjectKind::Requests, prepid) {
            return Ok(Envelope::failure("injected failure"));
        }
        let Some(raw) = self.record(ObjectKind::Requests, prepid) else {
            return Ok(Envelope::failure(format!("{prepid} does not exist")));
        };
        let mut request: Request = serde_json::from_value(raw).expect("decode request");
        if request.status == "done" {
            return Ok(Envelope::failure("done requests cannot be soft reset"));
        }
        if !request.has_validation_results() {
            return Ok(Envelope::failure("soft reset needs validation results"));
        }
        request.approval = "approve".to_string();
        request.status = "approved".to_string();
        self.store(
            ObjectKind::Requests,
            prepid,
            serde_json::to_value(&request).expect("encode request"),
        );
        Ok(Envelope::success())
    }

    fn rewind_to_root(&self, chain_prepid: &str) -> Result<Envelope> {
        if self.log("rewind_to_root", ObjectKind::ChainedRequests, chain_prepid) {
            return Ok(Envelope::failure("injected failure"));
        }
        let Some(raw) = self.record(ObjectKind::ChainedRequests, chain_prepid) else {
            return Ok(Envelope::failure(format!("{chain_prepid} does not exist")));
        };
        let mut chain: ChainedRequest = serde_json::from_value(raw).expect("decode chain");
        for prepid in chain.non_root().to_vec() {
            self.rewind_request(&prepid, false);
        }
        chain.step = 0;
        self.store(
            ObjectKind::ChainedRequests,
            chain_prepid,
            serde_json::to_value(&chain).expect("encode chain"),
        );
        Ok(Envelope::success())
    }

    fn flow(&self, chain_prepid: &str, force: bool) -> Result<Envelope> {
        let operation = if force { "force_flow" } else { "flow" };
        if self.log(operation, ObjectKind::ChainedRequests, chain_prepid) {
            return Ok(Envelope::failure("injected failure"));
        }
        let Some(raw) = self.record(ObjectKind::ChainedRequests, chain_prepid) else {
            return Ok(Envelope::failure(format!("{chain_prepid} does not exist")));
        };
        let mut chain: ChainedRequest = serde_json::from_value(raw).expect("decode chain");
        if !chain.action_parameters.flag && !force {
            return Ok(Envelope::failure("chain is disabled"));
        }
        let Some(next) = chain.chain.get(chain.step + 1).cloned() else {
            return Ok(Envelope::failure("nothing to flow"));
        };
        if let Some(mut record) = self.record(ObjectKind::Requests, &next) {
            record["approval"] = json!("submit");
            record["status"] = json!("submitted");
            self.store(ObjectKind::Requests, &next, record);
        }
        chain.step += 1;
        self.store(
            ObjectKind::ChainedRequests,
            chain_prepid,
            serde_json::to_value(&chain).expect("encode chain"),
        );
        Ok(Envelope::success())
    }

    fn reserve(&self, chain_prepid: &str, target_campaign: &str) -> Result<Envelope> {
        if self.log("reserve", ObjectKind::ChainedRequests, chain_prepid) {
            return Ok(Envelope::failure("injected failure"));
        }
        let Some(raw) = self.record(ObjectKind::ChainedRequests, chain_prepid) else {
            return Ok(Envelope::failure(format!("{chain_prepid} does not exist")));
        };
        let mut chain: ChainedRequest = serde_json::from_value(raw).expect("decode chain");
        let Some(template) = self.record(ObjectKind::ChainedCampaigns, &chain.member_of_campaign)
        else {
            return Ok(Envelope::failure("chained campaign does not exist"));
        };
        let template: ChainedCampaign =
            serde_json::from_value(template).expect("decode chained campaign");
        let names: Vec<String> = template.campaign_names().map(str::to_string).collect();
        let Some(target_index) = names.iter().position(|name| name == target_campaign) else {
            return Ok(Envelope::failure(format!(
                "{target_campaign} is not part of {}",
                template.prepid
            )));
        };
        let pwg = chain
            .root()
            .and_then(|root| root.split('-').next())
            .unwrap_or("PPD")
            .to_string();
        for campaign in names
            .iter()
            .take(target_index + 1)
            .skip(chain.chain.len())
        {
            let number = self.next_number();
            let prepid = format!("{pwg}-{campaign}-{:05}", 1000 + number);
            let input = chain.chain.last().cloned().unwrap_or_default();
            self.store(
                ObjectKind::Requests,
                &prepid,
                json!({
                    "prepid": prepid.clone(),
                    "type": "Prod",
                    "approval": "none",
                    "status": "new",
                    "member_of_chain": [chain_prepid],
                    "member_of_campaign": campaign,
                    "keep_output": [false],
                    "input_from": input,
                    "tags": [],
                }),
            );
            chain.chain.push(prepid);
        }
        self.store(
            ObjectKind::ChainedRequests,
            chain_prepid,
            serde_json::to_value(&chain).expect("encode chain"),
        );
        Ok(Envelope::success())
    }
}

pub const ROOT: &str = "PPD-Run3Summer22wmLHEGS-00001";
pub const CHAIN: &str = "PPD-chain_Run3Summer22wmLHEGS_flowRun3Summer22DRPremix-00001";
pub const TEMPLATE: &str = "chain_Run3Summer22wmLHEGS_flowRun3Summer22DRPremix";
pub const STAGE_A: &str = "PPD-Run3Summer22DRPremix-00001";
pub const STAGE_B: &str = "PPD-Run3Summer22MiniAODv4-00001";
pub const BRANCH_CHAIN: &str = "PPD-chain_Run3Summer22wmLHEGS_flowRun3Summer22DRPremix-00003";
pub const BRANCH_STAGE: &str = "PPD-Run3Summer22MiniAODv4-00003";

pub fn template_record(prepid: &str) -> Value {
    json!({
        "prepid": prepid,
        "campaigns": [
            ["Run3Summer22wmLHEGS", null],
            ["Run3Summer22DRPremix", "flowRun3Summer22DRPremix"],
            ["Run3Summer22MiniAODv4", "flowRun3Summer22MiniAODv4"],
            ["Run3Summer22NanoAODv12", "flowRun3Summer22NanoAODv12"],
        ],
    })
}

pub fn root_record(prepid: &str, chains: &[&str]) -> Value {
    json!({
        "prepid": prepid,
        "type": "LHE",
        "approval": "submit",
        "status": "done",
        "member_of_chain": chains,
        "member_of_campaign": "Run3Summer22wmLHEGS",
        "keep_output": [false],
        "validation": {"results": {"8": {"time_per_event": 2.5, "size_per_event": 310.0}}},
        "tags": [],
        "sequences": [{"conditions": "124X_mcRun3_2022_realistic_v12"}],
    })
}

pub fn stage_record(prepid: &str, campaign: &str, chain: &str, input: &str) -> Value {
    json!({
        "prepid": prepid,
        "type": "Prod",
        "approval": "submit",
        "status": "done",
        "member_of_chain": [chain],
        "member_of_campaign": campaign,
        "keep_output": [false],
        "input_from": input,
        "tags": [],
    })
}

pub fn chain_record(prepid: &str, chain: &[&str], flag: bool) -> Value {
    json!({
        "prepid": prepid,
        "chain": chain,
        "step": chain.len() - 1,
        "action_parameters": {"flag": flag, "threshold": 0},
        "member_of_campaign": TEMPLATE,
    })
}

/// Root `X` (validated, submit/done) in chain `C = [X, A, B]`.
pub fn example_world() -> MemoryGateway {
    let gateway = MemoryGateway::new();
    gateway.insert(ObjectKind::ChainedCampaigns, template_record(TEMPLATE));
    gateway.insert(ObjectKind::Requests, root_record(ROOT, &[CHAIN]));
    gateway.insert(
        ObjectKind::Requests,
        stage_record(STAGE_A, "Run3Summer22DRPremix", CHAIN, ROOT),
    );
    gateway.insert(
        ObjectKind::Requests,
        stage_record(STAGE_B, "Run3Summer22MiniAODv4", CHAIN, STAGE_A),
    );
    gateway.insert(
        ObjectKind::ChainedRequests,
        chain_record(CHAIN, &[ROOT, STAGE_A, STAGE_B], true),
    );
    gateway
}

/// The example world plus `C2 = [X, A, B2]`: both chains share `A` and
/// branch after it, so `B2` also takes `A` as input.
pub fn branched_world() -> MemoryGateway {
    let gateway = example_world();
    for prepid in [ROOT, STAGE_A] {
        let mut record = gateway.record(ObjectKind::Requests, prepid).expect("fixture record");
        record["member_of_chain"] = json!([CHAIN, BRANCH_CHAIN]);
        gateway.insert(ObjectKind::Requests, record);
    }
    gateway.insert(
        ObjectKind::Requests,
        stage_record(BRANCH_STAGE, "Run3Summer22MiniAODv4", BRANCH_CHAIN, STAGE_A),
    );
    gateway.insert(
        ObjectKind::ChainedRequests,
        chain_record(BRANCH_CHAIN, &[ROOT, STAGE_A, BRANCH_STAGE], true),
    );
    gateway
}
