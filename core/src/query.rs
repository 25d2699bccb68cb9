//! Boolean queries over an artifact.  A query is in conjunctive normal form: every clause must be
//! satisfied and a clause is satisfied by the values of any of its keys.  Negated keys remove
//! their values from the result, there is no universe of "all values" to complement against.
//!
//! Clauses are evaluated cheapest first (by stored value count) and evaluation stops as soon as
//! the running intersection is empty.

use crate::db::value_map::ValueIter;
use crate::db::DbReader;
use crate::error::query::QueryError;
use crate::error::FetchError;
use crate::mphf::PerfectHash;
use log::warn;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Anything that can answer key lookups for the query engine.
pub trait ValueSource {
    /// Values for key in ascending byte order, None if key is not present.
    fn lookup(&self, key: &[u8]) -> Result<Option<ValueIter<'_>>, FetchError>;

    /// Number of values for key, None if key is not present.  Used to order clauses so it should
    /// be cheap.
    fn value_count(&self, key: &[u8]) -> Result<Option<u64>, FetchError>;
}

impl<B, H> ValueSource for DbReader<B, H>
where
    B: AsRef<[u8]>,
    H: PerfectHash,
{
    fn lookup(&self, key: &[u8]) -> Result<Option<ValueIter<'_>>, FetchError> {
        DbReader::lookup(self, key)
    }

    fn value_count(&self, key: &[u8]) -> Result<Option<u64>, FetchError> {
        DbReader::value_count(self, key)
    }
}

/// A key in a clause, possibly negated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Literal {
    key: Vec<u8>,
    negated: bool,
}

impl Literal {
    /// Matches the values of key.
    pub fn new<K: Into<Vec<u8>>>(key: K) -> Self {
        Self {
            key: key.into(),
            negated: false,
        }
    }

    /// Excludes the values of key.
    pub fn not<K: Into<Vec<u8>>>(key: K) -> Self {
        Self {
            key: key.into(),
            negated: true,
        }
    }

    /// The key bytes.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Is this a negated key?
    pub fn is_negated(&self) -> bool {
        self.negated
    }
}

/// An OR of literals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Clause {
    literals: Vec<Literal>,
}

impl Clause {
    /// Clause from literals.
    pub fn new(literals: Vec<Literal>) -> Self {
        Self { literals }
    }

    /// Clause matching any of keys.
    pub fn any<I, K>(keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<Vec<u8>>,
    {
        Self {
            literals: keys.into_iter().map(Literal::new).collect(),
        }
    }

    /// Add a literal to this clause.
    pub fn or(mut self, literal: Literal) -> Self {
        self.literals.push(literal);
        self
    }

    /// The literals of this clause.
    pub fn literals(&self) -> &[Literal] {
        &self.literals
    }

    /// True if every literal is negated (and there is at least one).
    pub fn is_negative(&self) -> bool {
        !self.literals.is_empty() && self.literals.iter().all(|l| l.negated)
    }
}

/// An AND of clauses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Query {
    clauses: Vec<Clause>,
}

impl Query {
    /// Query from clauses.
    pub fn new(clauses: Vec<Clause>) -> Self {
        Self { clauses }
    }

    /// Query requiring every key, one single key clause per key.
    pub fn all<I, K>(keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<Vec<u8>>,
    {
        Self {
            clauses: keys
                .into_iter()
                .map(|key| Clause::new(vec![Literal::new(key)]))
                .collect(),
        }
    }

    /// Query with a single clause matching any of keys.
    pub fn any<I, K>(keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<Vec<u8>>,
    {
        Self {
            clauses: vec![Clause::any(keys)],
        }
    }

    /// Add a clause to this query.
    pub fn and(mut self, clause: Clause) -> Self {
        self.clauses.push(clause);
        self
    }

    /// The clauses of this query.
    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    /// Check the query is well formed: at least one clause and no empty clauses.
    pub fn validate(&self) -> Result<(), QueryError> {
        if self.clauses.is_empty() {
            return Err(QueryError::EmptyQuery);
        }
        if let Some(idx) = self.clauses.iter().position(|c| c.literals.is_empty()) {
            return Err(QueryError::EmptyClause(idx));
        }
        Ok(())
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.negated {
            write!(f, "~")?;
        }
        write!(f, "{}", String::from_utf8_lossy(&self.key))
    }
}

impl fmt::Display for Clause {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, literal) in self.literals.iter().enumerate() {
            if i > 0 {
                write!(f, " | ")?;
            }
            write!(f, "{}", literal)?;
        }
        Ok(())
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, clause) in self.clauses.iter().enumerate() {
            if i > 0 {
                write!(f, " & ")?;
            }
            write!(f, "{}", clause)?;
        }
        Ok(())
    }
}

/// Limits on one evaluation.
#[derive(Debug, Clone, Default)]
pub struct QueryLimits {
    max_scanned: Option<u64>,
    cancel: Option<Arc<AtomicBool>>,
}

impl QueryLimits {
    /// No limits.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop once more than max values have been read.
    pub fn set_max_scanned(mut self, max: u64) -> Self {
        self.max_scanned = Some(max);
        self
    }

    /// Stop when cancel is set, checked between clauses.
    pub fn set_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// The scan cap if any.
    pub fn max_scanned(&self) -> Option<u64> {
        self.max_scanned
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(false)
    }
}

/// Why an evaluation stopped early.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The cancellation flag was set.
    Cancelled,
    /// More values were read than the configured cap.
    ScanCapReached,
}

/// Did the evaluation finish?
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum QueryStatus {
    /// Every needed clause was evaluated, the values are the answer.
    Complete,
    /// Evaluation stopped early, the values are the running result of the clauses finished so
    /// far (empty if none finished).
    Partial(StopReason),
}

/// Result of evaluate().
#[derive(Debug, Clone)]
pub struct QueryResult<'s> {
    values: BTreeSet<&'s [u8]>,
    status: QueryStatus,
    scanned: u64,
}

impl<'s> QueryResult<'s> {
    /// The matching values in byte order.
    pub fn values(&self) -> &BTreeSet<&'s [u8]> {
        &self.values
    }

    /// Take the values.
    pub fn into_values(self) -> BTreeSet<&'s [u8]> {
        self.values
    }

    /// Copy the values out so they can outlive the source.
    pub fn to_vecs(&self) -> Vec<Vec<u8>> {
        self.values.iter().map(|v| v.to_vec()).collect()
    }

    /// Completion status.
    pub fn status(&self) -> QueryStatus {
        self.status
    }

    /// True if the evaluation finished.
    pub fn is_complete(&self) -> bool {
        self.status == QueryStatus::Complete
    }

    /// Number of values read from the source.
    pub fn scanned(&self) -> u64 {
        self.scanned
    }

    /// Number of matching values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// No matching values?
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Evaluates queries against a value source.
pub struct QueryEngine<'s, S: ValueSource + ?Sized> {
    source: &'s S,
    limits: QueryLimits,
}

struct PlannedClause<'q> {
    clause: &'q Clause,
    cost: u64,
    negative: bool,
}

/// Evaluation state, tracks the scanned count against the cap.
struct Scan<'l> {
    limits: &'l QueryLimits,
    scanned: u64,
}

impl<'l> Scan<'l> {
    /// Count one value, false if the cap was passed.
    #[inline]
    fn step(&mut self) -> bool {
        self.scanned += 1;
        self.limits
            .max_scanned
            .map(|max| self.scanned <= max)
            .unwrap_or(true)
    }
}

impl<'s, S: ValueSource + ?Sized> QueryEngine<'s, S> {
    /// Engine over source with no limits.
    pub fn new(source: &'s S) -> Self {
        Self {
            source,
            limits: QueryLimits::default(),
        }
    }

    /// Engine over source using limits.
    pub fn with_limits(source: &'s S, limits: QueryLimits) -> Self {
        Self { source, limits }
    }

    /// Evaluate query.
    /// Malformed queries fail before any lookup is done.  Stopping early (cancel or scan cap) is
    /// not an error, the result status is Partial.
    pub fn evaluate(&self, query: &Query) -> Result<QueryResult<'s>, QueryError> {
        query.validate()?;
        let plan = self.plan(query)?;
        let mut scan = Scan {
            limits: &self.limits,
            scanned: 0,
        };
        let mut running: Option<BTreeSet<&'s [u8]>> = None;
        for planned in plan {
            if self.limits.is_cancelled() {
                return Ok(self.partial(running, scan.scanned, StopReason::Cancelled));
            }
            let finished = if planned.negative {
                match running.as_mut() {
                    // Only negated clauses, nothing to subtract from.
                    None => break,
                    Some(current) => self.remove_negated(current, planned.clause, &mut scan)?,
                }
            } else {
                match self.intersect(running.as_ref(), planned.clause, &mut scan)? {
                    Some(set) => {
                        running = Some(set);
                        true
                    }
                    None => false,
                }
            };
            if !finished {
                return Ok(self.partial(running, scan.scanned, StopReason::ScanCapReached));
            }
            if running.as_ref().map(|set| set.is_empty()).unwrap_or(false) {
                break;
            }
        }
        Ok(QueryResult {
            values: running.unwrap_or_default(),
            status: QueryStatus::Complete,
            scanned: scan.scanned,
        })
    }

    /// Order clauses cheapest first, purely negated clauses after all others.
    fn plan<'q>(&self, query: &'q Query) -> Result<Vec<PlannedClause<'q>>, QueryError> {
        let mut plan = Vec::with_capacity(query.clauses.len());
        for clause in &query.clauses {
            let negative = clause.is_negative();
            let mut cost = 0_u64;
            for literal in &clause.literals {
                if literal.negated == negative {
                    cost = cost.saturating_add(
                        self.source.value_count(&literal.key)?.unwrap_or_default(),
                    );
                }
            }
            plan.push(PlannedClause {
                clause,
                cost,
                negative,
            });
        }
        // Stable so equal cost clauses keep query order.
        plan.sort_by_key(|p| (p.negative, p.cost));
        Ok(plan)
    }

    /// Union of the clause's positive values restricted to running (if any) minus its negative
    /// values.  None if the scan cap was passed.
    fn intersect(
        &self,
        running: Option<&BTreeSet<&'s [u8]>>,
        clause: &Clause,
        scan: &mut Scan,
    ) -> Result<Option<BTreeSet<&'s [u8]>>, QueryError> {
        let mut set = BTreeSet::new();
        for literal in clause.literals.iter().filter(|l| !l.negated) {
            if let Some(values) = self.source.lookup(&literal.key)? {
                for value in values {
                    if !scan.step() {
                        return Ok(None);
                    }
                    if running.map(|r| r.contains(value)).unwrap_or(true) {
                        set.insert(value);
                    }
                }
            }
        }
        if self.remove_negated(&mut set, clause, scan)? {
            Ok(Some(set))
        } else {
            Ok(None)
        }
    }

    /// Remove the values of every negated literal from set.  False if the scan cap was passed,
    /// set is then left as it was.
    fn remove_negated(
        &self,
        set: &mut BTreeSet<&'s [u8]>,
        clause: &Clause,
        scan: &mut Scan,
    ) -> Result<bool, QueryError> {
        let mut removed = Vec::new();
        for literal in clause.literals.iter().filter(|l| l.negated) {
            if set.is_empty() {
                break;
            }
            if let Some(values) = self.source.lookup(&literal.key)? {
                for value in values {
                    if !scan.step() {
                        return Ok(false);
                    }
                    if set.contains(value) {
                        removed.push(value);
                    }
                }
            }
        }
        for value in removed {
            set.remove(value);
        }
        Ok(true)
    }

    fn partial(
        &self,
        running: Option<BTreeSet<&'s [u8]>>,
        scanned: u64,
        reason: StopReason,
    ) -> QueryResult<'s> {
        warn!("query stopped early ({:?}) after {} values", reason, scanned);
        QueryResult {
            values: running.unwrap_or_default(),
            status: QueryStatus::Partial(reason),
            scanned,
        }
    }
}
