//! A linearizability checker for recorded operation histories.
//!
//! Given a sequential reference model and a history of concurrent operations
//! with call/return timestamps, the checker searches for a linearization: a
//! total order of the operations, consistent with real time, that the model
//! accepts. The search is the Wing & Gong algorithm over a just-lifted entry
//! list, pruned by memoizing visited (linearized-set, state) configurations.
//!
//! Checking is NP-hard in general, so the search runs under a caller-supplied
//! deadline and reports `Unknown` when it expires.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::time::{Duration, Instant};

/// A sequential reference model. `step` decides whether an observed operation
/// is legal from a given state and produces the successor state.
pub trait Model {
    type State: Clone;
    type Input;
    type Output;

    fn init(&self) -> Self::State;
    fn step(
        &self,
        state: &Self::State,
        input: &Self::Input,
        output: &Self::Output,
    ) -> (bool, Self::State);
    fn equal(&self, left: &Self::State, right: &Self::State) -> bool;
    fn describe_operation(&self, input: &Self::Input, output: &Self::Output) -> String;
    fn describe_state(&self, state: &Self::State) -> String;
}

/// One operation in a recorded history.
#[derive(Clone, Debug)]
pub struct HistoryOp<I, O> {
    pub client_id: usize,
    pub input: I,
    pub output: O,
    pub call_ns: i64,
    pub return_ns: i64,
}

/// Outcome of a check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckResult {
    /// A linearization exists.
    Ok,
    /// No linearization exists.
    Illegal,
    /// The deadline expired before the search finished.
    Unknown,
}

/// Diagnostic detail from a check.
#[derive(Clone, Debug, Default)]
pub struct CheckInfo {
    /// The longest linearizable prefix discovered, as indices into the
    /// history in linearization order.
    pub longest_prefix: Vec<usize>,
}

const NIL: usize = usize::MAX;

/// Check a single history against the model within the deadline.
pub fn check_operations<M: Model>(
    model: &M,
    history: &[HistoryOp<M::Input, M::Output>],
    deadline: Duration,
) -> (CheckResult, CheckInfo) {
    let n = history.len();
    if n == 0 {
        return (CheckResult::Ok, CheckInfo::default());
    }

    // Sort call/return events by time. At equal timestamps calls order before
    // returns, which keeps zero-duration operations well-formed and treats
    // timestamp ties as concurrency.
    let mut events: Vec<(i64, bool, usize)> = Vec::with_capacity(2 * n);
    for (i, op) in history.iter().enumerate() {
        events.push((op.call_ns, false, i));
        events.push((op.return_ns, true, i));
    }
    events.sort_unstable();

    // Doubly-linked event list with a head sentinel at index 2n. Lifted nodes
    // keep their pointers; the LIFO discipline of the search makes relinking
    // them valid.
    let head = 2 * n;
    let mut node_op = vec![0usize; 2 * n];
    let mut node_is_call = vec![false; 2 * n];
    let mut next = vec![NIL; 2 * n + 1];
    let mut prev = vec![NIL; 2 * n + 1];
    let mut ret_node = vec![NIL; n];
    let mut last = head;
    for (idx, &(_, is_return, op)) in events.iter().enumerate() {
        node_op[idx] = op;
        node_is_call[idx] = !is_return;
        if is_return {
            ret_node[op] = idx;
        }
        next[last] = idx;
        prev[idx] = last;
        last = idx;
    }
    next[last] = NIL;

    let lift = |next: &mut Vec<usize>, prev: &mut Vec<usize>, call: usize, ret: usize| {
        let (cp, cn) = (prev[call], next[call]);
        next[cp] = cn;
        if cn != NIL {
            prev[cn] = cp;
        }
        let (rp, rn) = (prev[ret], next[ret]);
        next[rp] = rn;
        if rn != NIL {
            prev[rn] = rp;
        }
    };
    let unlift = |next: &mut Vec<usize>, prev: &mut Vec<usize>, call: usize, ret: usize| {
        let (rp, rn) = (prev[ret], next[ret]);
        next[rp] = ret;
        if rn != NIL {
            prev[rn] = ret;
        }
        let (cp, cn) = (prev[call], next[call]);
        next[cp] = call;
        if cn != NIL {
            prev[cn] = call;
        }
    };

    let start = Instant::now();
    let mut state = model.init();
    let mut linearized = BitSet::new(n);
    let mut cache: HashMap<BitSet, Vec<M::State>> = HashMap::new();
    cache.insert(linearized.clone(), vec![state.clone()]);
    // Stack of linearized calls with the state each one replaced.
    let mut calls: Vec<(usize, M::State)> = Vec::new();
    let mut longest: Vec<usize> = Vec::new();

    let mut entry = next[head];
    loop {
        if next[head] == NIL {
            let order = calls.iter().map(|&(node, _)| node_op[node]).collect();
            return (CheckResult::Ok, CheckInfo { longest_prefix: order });
        }
        if start.elapsed() >= deadline {
            return (CheckResult::Unknown, CheckInfo { longest_prefix: longest });
        }

        if entry != NIL && node_is_call[entry] {
            let op = node_op[entry];
            let (ok, new_state) = model.step(&state, &history[op].input, &history[op].output);
            let mut advanced = false;
            if ok {
                let mut new_linearized = linearized.clone();
                new_linearized.set(op);
                let seen = {
                    let states = cache.entry(new_linearized.clone()).or_default();
                    if states.iter().any(|s| model.equal(s, &new_state)) {
                        true
                    } else {
                        states.push(new_state.clone());
                        false
                    }
                };
                if !seen {
                    let prev_state = std::mem::replace(&mut state, new_state);
                    calls.push((entry, prev_state));
                    linearized = new_linearized;
                    if calls.len() > longest.len() {
                        longest = calls.iter().map(|&(node, _)| node_op[node]).collect();
                    }
                    lift(&mut next, &mut prev, entry, ret_node[op]);
                    entry = next[head];
                    advanced = true;
                }
            }
            if !advanced {
                entry = next[entry];
            }
        } else {
            // Hit a return (or the end of the list) without being able to
            // linearize anything new: back the most recent choice out.
            let Some((call, prev_state)) = calls.pop() else {
                return (CheckResult::Illegal, CheckInfo { longest_prefix: longest });
            };
            state = prev_state;
            let op = node_op[call];
            linearized.clear(op);
            unlift(&mut next, &mut prev, call, ret_node[op]);
            entry = next[call];
        }
    }
}

/// Render a self-contained HTML visualization of a history: one timeline row
/// per client plus an operation table annotated with the longest linearizable
/// prefix the search found.
pub fn visualize<M: Model>(
    model: &M,
    history: &[HistoryOp<M::Input, M::Output>],
    info: &CheckInfo,
    title: &str,
) -> Vec<u8> {
    let min_call = history.iter().map(|op| op.call_ns).min().unwrap_or(0);
    let max_return = history
        .iter()
        .map(|op| op.return_ns)
        .max()
        .unwrap_or(min_call);
    let span = (max_return - min_call).max(1) as f64;

    // Linearization rank per op, if it made the longest prefix.
    let mut rank = vec![None; history.len()];
    for (order, &op) in info.longest_prefix.iter().enumerate() {
        if op < history.len() {
            rank[op] = Some(order);
        }
    }

    let mut clients: Vec<usize> = history.iter().map(|op| op.client_id).collect();
    clients.sort_unstable();
    clients.dedup();

    let mut html = String::new();
    html.push_str("<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n");
    let _ = write!(html, "<title>{}</title>\n", escape(title));
    html.push_str(
        "<style>\n\
         body { font-family: monospace; margin: 2em; background: #fdfdfd; color: #222; }\n\
         h1 { font-size: 1.2em; }\n\
         .row { display: flex; align-items: center; margin: 2px 0; }\n\
         .label { width: 8em; flex: none; }\n\
         .track { position: relative; height: 1.4em; flex: 1; background: #f0f0f0; }\n\
         .op { position: absolute; top: 2px; bottom: 2px; min-width: 3px; background: #9ad; }\n\
         .op.err { background: #d99; }\n\
         .op.lin { outline: 2px solid #374; }\n\
         table { border-collapse: collapse; margin-top: 2em; }\n\
         td, th { border: 1px solid #ccc; padding: 2px 8px; text-align: left; }\n\
         </style>\n</head>\n<body>\n",
    );
    let _ = write!(
        html,
        "<h1>{}</h1>\n<p>{} operations; longest linearizable prefix: {}</p>\n",
        escape(title),
        history.len(),
        info.longest_prefix.len()
    );

    for client in &clients {
        let _ = write!(
            html,
            "<div class=\"row\"><div class=\"label\">client {client}</div><div class=\"track\">"
        );
        for (i, op) in history.iter().enumerate() {
            if op.client_id != *client {
                continue;
            }
            let left = (op.call_ns - min_call) as f64 / span * 100.0;
            let width = (op.return_ns - op.call_ns) as f64 / span * 100.0;
            let mut classes = String::from("op");
            if model
                .describe_operation(&op.input, &op.output)
                .contains("= ERR")
            {
                classes.push_str(" err");
            }
            if rank[i].is_some() {
                classes.push_str(" lin");
            }
            let _ = write!(
                html,
                "<div class=\"{classes}\" style=\"left:{left:.3}%;width:{width:.3}%\" \
                 title=\"{}\"></div>",
                escape(&model.describe_operation(&op.input, &op.output)),
            );
        }
        html.push_str("</div></div>\n");
    }

    // Walk the model along the longest prefix to show intermediate states.
    html.push_str("<h1>longest linearizable prefix</h1>\n<table>\n");
    html.push_str("<tr><th>#</th><th>operation</th><th>state after</th></tr>\n");
    let mut state = model.init();
    for (order, &op) in info.longest_prefix.iter().enumerate() {
        let op = &history[op];
        let (_, new_state) = model.step(&state, &op.input, &op.output);
        state = new_state;
        let _ = write!(
            html,
            "<tr><td>{order}</td><td>{}</td><td>{}</td></tr>\n",
            escape(&model.describe_operation(&op.input, &op.output)),
            escape(&model.describe_state(&state)),
        );
    }
    html.push_str("</table>\n");

    html.push_str("<h1>history</h1>\n<table>\n");
    html.push_str(
        "<tr><th>client</th><th>operation</th><th>call (us)</th><th>return (us)</th>\
         <th>linearized</th></tr>\n",
    );
    let mut order: Vec<usize> = (0..history.len()).collect();
    order.sort_by_key(|&i| (history[i].call_ns, history[i].client_id));
    for i in order {
        let op = &history[i];
        let _ = write!(
            html,
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
            op.client_id,
            escape(&model.describe_operation(&op.input, &op.output)),
            (op.call_ns - min_call) / 1_000,
            (op.return_ns - min_call) / 1_000,
            rank[i].map_or_else(|| "-".to_string(), |r| r.to_string()),
        );
    }
    html.push_str("</table>\n</body>\n</html>\n");
    html.into_bytes()
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Fixed-size bitset over operation indices, used as the cache key for
/// visited configurations.
#[derive(Clone, PartialEq, Eq, Hash)]
struct BitSet(Vec<u64>);

impl BitSet {
    fn new(n: usize) -> Self {
        Self(vec![0; n.div_ceil(64)])
    }

    fn set(&mut self, i: usize) {
        self.0[i / 64] |= 1 << (i % 64);
    }

    fn clear(&mut self, i: usize) {
        self.0[i / 64] &= !(1 << (i % 64));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client;
    use crate::op::Op;
    use crate::proptest::{OpInput, OpOutput, RegisterModel};

    const LONG: Duration = Duration::from_secs(10);

    fn op(
        client_id: usize,
        op: Op,
        value: &str,
        err: Option<client::Error>,
        call_ns: i64,
        return_ns: i64,
    ) -> HistoryOp<OpInput, OpOutput> {
        HistoryOp {
            client_id,
            input: OpInput {
                op,
                key: "key0".to_string(),
                value: if op == Op::Set {
                    value.to_string()
                } else {
                    String::new()
                },
            },
            output: OpOutput {
                value: if op == Op::Get && err.is_none() {
                    value.to_string()
                } else {
                    String::new()
                },
                err,
            },
            call_ns,
            return_ns,
        }
    }

    #[test]
    fn empty_history_is_linearizable() {
        let (result, _) = check_operations(&RegisterModel, &[], LONG);
        assert_eq!(result, CheckResult::Ok);
    }

    #[test]
    fn sequential_history_is_linearizable() {
        let history = vec![
            op(0, Op::Get, "", Some(client::Error::NotFound), 0, 10),
            op(0, Op::Set, "a", None, 20, 30),
            op(0, Op::Get, "a", None, 40, 50),
            op(0, Op::Del, "", None, 60, 70),
            op(0, Op::Get, "", Some(client::Error::NotFound), 80, 90),
        ];
        let (result, info) = check_operations(&RegisterModel, &history, LONG);
        assert_eq!(result, CheckResult::Ok);
        assert_eq!(info.longest_prefix.len(), history.len());
    }

    #[test]
    fn stale_read_is_illegal() {
        // The second SET finished strictly before the GET began, so the GET
        // may not observe the first value.
        let history = vec![
            op(0, Op::Set, "a", None, 0, 10),
            op(0, Op::Set, "b", None, 20, 30),
            op(1, Op::Get, "a", None, 40, 50),
        ];
        let (result, info) = check_operations(&RegisterModel, &history, LONG);
        assert_eq!(result, CheckResult::Illegal);
        assert!(info.longest_prefix.len() < history.len());
    }

    #[test]
    fn never_written_read_is_illegal() {
        let history = vec![
            op(0, Op::Set, "a", None, 0, 10),
            op(1, Op::Get, "b", None, 20, 30),
        ];
        let (result, _) = check_operations(&RegisterModel, &history, LONG);
        assert_eq!(result, CheckResult::Illegal);
    }

    #[test]
    fn overlapping_writes_allow_either_order() {
        let history = vec![
            op(0, Op::Set, "a", None, 0, 100),
            op(1, Op::Set, "b", None, 50, 150),
            op(2, Op::Get, "a", None, 200, 300),
        ];
        let (result, _) = check_operations(&RegisterModel, &history, LONG);
        assert_eq!(result, CheckResult::Ok);

        let history = vec![
            op(0, Op::Set, "a", None, 0, 100),
            op(1, Op::Set, "b", None, 50, 150),
            op(2, Op::Get, "b", None, 200, 300),
        ];
        let (result, _) = check_operations(&RegisterModel, &history, LONG);
        assert_eq!(result, CheckResult::Ok);
    }

    #[test]
    fn uncertain_writes_tolerate_both_outcomes() {
        // The SET failed with an unknown outcome: a later GET may see either
        // the new value or nothing at all.
        let failed = Some(client::Error::Transport("broken pipe".to_string()));
        let history = vec![
            op(0, Op::Set, "a", failed.clone(), 0, 10),
            op(1, Op::Get, "a", None, 20, 30),
        ];
        let (result, _) = check_operations(&RegisterModel, &history, LONG);
        assert_eq!(result, CheckResult::Ok);

        // An uncertain SET folds its value into the possibility set and
        // drops the absence marker, so a strictly-later NotFound read is a
        // violation; a concurrent one can linearize before the SET.
        let history = vec![
            op(0, Op::Set, "a", failed.clone(), 0, 100),
            op(1, Op::Get, "", Some(client::Error::NotFound), 20, 30),
        ];
        let (result, _) = check_operations(&RegisterModel, &history, LONG);
        assert_eq!(result, CheckResult::Ok);

        let history = vec![
            op(0, Op::Set, "a", failed, 0, 10),
            op(1, Op::Get, "", Some(client::Error::NotFound), 20, 30),
        ];
        let (result, _) = check_operations(&RegisterModel, &history, LONG);
        assert_eq!(result, CheckResult::Illegal);
    }

    #[test]
    fn uncertain_delete_leaves_presence_ambiguous() {
        let failed = Some(client::Error::Transport("recv timed out".to_string()));
        let history = vec![
            op(0, Op::Set, "a", None, 0, 10),
            op(0, Op::Del, "", failed, 20, 30),
            op(1, Op::Get, "a", None, 40, 50),
            op(1, Op::Get, "", Some(client::Error::NotFound), 60, 70),
        ];
        // An uncertain delete leaves both the old value and absence
        // possible, so observing the value and then absence is legal.
        let (result, _) = check_operations(&RegisterModel, &history, LONG);
        assert_eq!(result, CheckResult::Ok);
    }

    #[test]
    fn expired_deadline_is_unknown() {
        let history = vec![
            op(0, Op::Set, "a", None, 0, 10),
            op(0, Op::Get, "a", None, 20, 30),
        ];
        let (result, _) = check_operations(&RegisterModel, &history, Duration::ZERO);
        assert_eq!(result, CheckResult::Unknown);
    }

    #[test]
    fn visualization_is_self_contained_html() {
        let history = vec![
            op(0, Op::Set, "a", None, 0, 10),
            op(0, Op::Set, "b", None, 20, 30),
            op(1, Op::Get, "a", None, 40, 50),
        ];
        let (result, info) = check_operations(&RegisterModel, &history, LONG);
        assert_eq!(result, CheckResult::Illegal);

        let html = visualize(&RegisterModel, &history, &info, "key0");
        let html = String::from_utf8(html).expect("utf-8 html");
        assert!(html.starts_with("<!DOCTYPE html>"));
        assert!(html.contains("key0"));
        assert!(html.contains("SET key0 a"));
        assert!(html.contains("GET key0"));
    }
}
