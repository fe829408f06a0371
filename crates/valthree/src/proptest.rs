//! Property-based consistency testing for Valthree clusters.
//!
//! A workload assigns each client a series of GET/SET/DEL operations on a
//! single key. Running a workload records a per-operation call/return history;
//! checking partitions the history by key and verifies each partition for
//! linearizability under an uncertainty-tolerant register model. Because keys
//! are independent registers and all commands are single-key, per-key
//! linearizability composes into strong serializability of the whole store.

use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use antithesis_sdk::assert_unreachable;
use rand::rngs::SmallRng;
use rand::Rng;
use serde_json::json;

use crate::checker::{self, CheckResult, HistoryOp, Model};
use crate::client::{self, Client};
use crate::diceware;
use crate::op::Op;
use crate::strset::StrSet;

/// Arguments for calling a client.
#[derive(Clone, Debug)]
pub struct OpInput {
    pub op: Op,
    pub key: String,
    pub value: String,
}

/// Results from calling a client.
#[derive(Clone, Debug, Default)]
pub struct OpOutput {
    pub value: String,
    pub err: Option<client::Error>,
}

/// One operation in a workload: the instruction plus, after execution, the
/// observed result and timing.
#[derive(Clone, Debug)]
pub struct Operation {
    pub client_id: usize,
    pub input: OpInput,
    pub output: OpOutput,
    pub call_ns: i64,
    pub return_ns: i64,
}

/// Returned from `check_workloads` when verification timed out or the
/// observed behavior includes consistency violations.
///
/// For a consistency violation, `visualization` holds an interactive,
/// self-contained HTML document demonstrating the violation.
#[derive(Debug)]
pub struct Error {
    pub key: String,
    pub timed_out: bool,
    pub visualization: Vec<u8>,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.timed_out {
            write!(f, "{}: model timed out", self.key)
        } else {
            write!(f, "{}: history not linearizable", self.key)
        }
    }
}

impl std::error::Error for Error {}

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Nanoseconds since a process-wide monotonic epoch.
fn now_ns() -> i64 {
    epoch().elapsed().as_nanos() as i64
}

/// Generate a workload for a variable number of clients.
///
/// Each client is bound to a single key for the whole workload, which makes
/// per-key partitioning lossless.
pub fn gen_workloads(rng: &mut SmallRng) -> Vec<Vec<Operation>> {
    // To trigger consistency bugs, we want multiple clients operating
    // concurrently on a handful of keys.
    let keys: Vec<String> = (0..rng.gen_range(2..=4)).map(|i| format!("key{i}")).collect();
    let clients_per_key = rng.gen_range(2..=4);
    let ops_per_client = rng.gen_range(128..=255);
    // Bias the workload towards GETs, which makes checking for
    // linearizability faster.
    let mix = [Op::Get, Op::Get, Op::Get, Op::Set, Op::Set, Op::Del];

    let num_clients = keys.len() * clients_per_key;
    let mut workloads = Vec::with_capacity(num_clients);
    for client_id in 0..num_clients {
        let key = &keys[client_id % keys.len()];
        let mut workload = Vec::with_capacity(ops_per_client);
        for _ in 0..ops_per_client {
            workload.push(Operation {
                client_id,
                input: OpInput {
                    op: mix[rng.gen_range(0..mix.len())],
                    key: key.clone(),
                    value: diceware::gen_word(rng),
                },
                output: OpOutput::default(),
                call_ns: 0,
                return_ns: 0,
            });
        }
        workloads.push(workload);
    }
    workloads
}

/// Run a workload on a client, recording each operation's result and timing
/// in place. Operations are not retried; observed errors are part of the
/// history.
pub async fn run_workload(client: &mut Client, workload: &mut [Operation]) {
    let total = workload.len();
    for (i, op) in workload.iter_mut().enumerate() {
        if i % 100 == 0 {
            tracing::debug!(ops_complete = i, ops_left = total - i, "running workload");
        }
        op.call_ns = now_ns();
        match op.input.op {
            Op::Get => match client.get(&op.input.key).await {
                Ok(value) => op.output.value = value,
                Err(err) => op.output.err = Some(err),
            },
            Op::Set => {
                if let Err(err) = client.set(&op.input.key, &op.input.value).await {
                    op.output.err = Some(err);
                }
            }
            Op::Del => {
                if let Err(err) = client.del(&op.input.key).await {
                    op.output.err = Some(err);
                }
            }
            other => {
                assert_unreachable!(
                    "Unexpected operation in workload run",
                    &json!({ "op": other.as_str() })
                );
            }
        }
        op.return_ns = now_ns();
    }
}

/// Verify that the recorded behavior satisfies strong serializable
/// consistency. When no consistency anomalies are found, also returns the
/// fraction of operations that succeeded, as a measure of liveness.
///
/// Verification is NP-hard, so it may time out; the deadline applies to each
/// per-key partition.
pub fn check_workloads(deadline: Duration, workloads: &[Vec<Operation>]) -> Result<f64, Error> {
    // Valthree keys are linearizable. Debugging a whole workload is painful,
    // so partition the execution history by key and check each partition
    // individually; this also keeps the visualization restricted to the
    // offending key.
    let mut partitioned: HashMap<String, Vec<HistoryOp<OpInput, OpOutput>>> = HashMap::new();
    let mut successes = 0usize;
    let mut total = 0usize;
    for workload in workloads {
        for op in workload {
            total += 1;
            if op.output.err.is_none() {
                successes += 1;
            }
            partitioned
                .entry(op.input.key.clone())
                .or_default()
                .push(HistoryOp {
                    client_id: op.client_id,
                    input: op.input.clone(),
                    output: op.output.clone(),
                    call_ns: op.call_ns,
                    return_ns: op.return_ns,
                });
        }
    }
    let progress = if total == 0 {
        1.0
    } else {
        successes as f64 / total as f64
    };

    for (key, history) in &partitioned {
        let (result, info) = checker::check_operations(&RegisterModel, history, deadline);
        match result {
            CheckResult::Ok => continue,
            CheckResult::Unknown => {
                return Err(Error {
                    key: key.clone(),
                    timed_out: true,
                    visualization: Vec::new(),
                });
            }
            CheckResult::Illegal => {
                let visualization = checker::visualize(
                    &RegisterModel,
                    history,
                    &info,
                    &format!("consistency violation on {key}"),
                );
                return Err(Error {
                    key: key.clone(),
                    timed_out: false,
                    visualization,
                });
            }
        }
    }
    Ok(progress)
}

/// The per-key reference model: the set of values any correct implementation
/// could be holding, with the empty string standing in for an absent key.
pub struct RegisterModel;

impl Model for RegisterModel {
    type State = StrSet;
    type Input = OpInput;
    type Output = OpOutput;

    fn init(&self) -> StrSet {
        StrSet::new()
    }

    fn step(&self, state: &StrSet, input: &OpInput, output: &OpOutput) -> (bool, StrSet) {
        match input.op {
            Op::Get => match &output.err {
                None => (state.contains(&output.value), state.clone()),
                // Missing keys may be represented by an empty set or a set
                // containing the empty string.
                Some(client::Error::NotFound) => {
                    (state.contains("") || state.is_empty(), state.clone())
                }
                // Other failures are always okay.
                Some(_) => (true, state.clone()),
            },
            Op::Set => match &output.err {
                // Write definitely succeeded, so there's only one valid value.
                None => (true, StrSet::of([input.value.clone()])),
                // Write may have succeeded, so we expand the set of valid
                // values.
                Some(_) => (true, state.with([input.value.clone()])),
            },
            Op::Del => match &output.err {
                // Delete definitely succeeded, so the key must be missing.
                None => (true, StrSet::new()),
                // Delete may have succeeded: represent the potential absence
                // of the key with an empty string.
                Some(_) => (true, state.with([""])),
            },
            other => {
                assert_unreachable!(
                    "Unexpected step operation",
                    &json!({ "op": other.as_str() })
                );
                (true, state.clone())
            }
        }
    }

    fn equal(&self, left: &StrSet, right: &StrSet) -> bool {
        left == right
    }

    fn describe_operation(&self, input: &OpInput, output: &OpOutput) -> String {
        let mut result = output.value.clone();
        if result.is_empty() {
            result = "OK".to_string();
        }
        if let Some(err) = &output.err {
            result = format!("ERR {err}");
        }
        match input.op {
            Op::Get => format!("GET {} = {}", input.key, result),
            Op::Set => format!("SET {} {} = {}", input.key, input.value, result),
            Op::Del => format!("DEL {} = {}", input.key, result),
            other => format!("UNKNOWN {other}"),
        }
    }

    fn describe_state(&self, state: &StrSet) -> String {
        state.to_string()
    }
}
