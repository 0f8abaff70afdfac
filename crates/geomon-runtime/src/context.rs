//! The simulation context: lifecycle events, rule engine and run loop.
//!
//! A [`Sim`] is the single top-level orchestrator of one simulation.
//! Components react to lifecycle events through rules registered in the
//! central rule table; the run loop feeds records from the installed
//! data source and fires the events in a fixed order. Everything is
//! strictly single-threaded; tests can run several independent `Sim`s in
//! one process.

use crate::results::ResultSet;
use crate::source::{DataSource, DsMetadata};
use geomon_core::Record;
use std::cell::{Cell, RefCell};
use tracing::debug;

/// Lifecycle events fired by the scheduler, in the order of the run
/// loop. `StartRecord`/`EndRecord` fire once per record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimEvent {
    Init,
    StartStream,
    StartRecord,
    EndRecord,
    EndStream,
    Report,
    Results,
    Done,
}

const NUM_EVENTS: usize = 8;

impl SimEvent {
    fn index(self) -> usize {
        match self {
            SimEvent::Init => 0,
            SimEvent::StartStream => 1,
            SimEvent::StartRecord => 2,
            SimEvent::EndRecord => 3,
            SimEvent::EndStream => 4,
            SimEvent::Report => 5,
            SimEvent::Results => 6,
            SimEvent::Done => 7,
        }
    }
}

/// Opaque handle to a registered rule. Remains valid after cancellation;
/// cancelling twice is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleHandle {
    event: SimEvent,
    id: u64,
}

type Action = Box<dyn FnMut(&Sim)>;
type Condition = Box<dyn Fn(&Sim) -> bool>;

struct Rule {
    id: u64,
    cancelled: bool,
    condition: Option<Condition>,
    action: Option<Action>,
}

#[derive(Default)]
struct RuleTable {
    rules: [Vec<Rule>; NUM_EVENTS],
    next_id: u64,
}

/// One simulation: rule table, data feed, warmup buffer, the record
/// under dispatch, and the open result files.
#[derive(Default)]
pub struct Sim {
    rules: RefCell<RuleTable>,
    source: RefCell<Option<Box<dyn DataSource>>>,
    current: Cell<Option<Record>>,
    warmup: RefCell<Vec<Record>>,
    metadata: RefCell<Option<DsMetadata>>,
    stream_count: Cell<usize>,
    outputs: RefCell<ResultSet>,
}

impl Sim {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an unconditional rule for `event`. Rules fire in
    /// insertion order.
    pub fn on(&self, event: SimEvent, action: impl FnMut(&Sim) + 'static) -> RuleHandle {
        self.subscribe(event, None, Box::new(action))
    }

    /// Register a rule guarded by a nullary condition; the action runs
    /// only when the condition holds at dispatch time.
    pub fn on_if(
        &self,
        event: SimEvent,
        condition: impl Fn(&Sim) -> bool + 'static,
        action: impl FnMut(&Sim) + 'static,
    ) -> RuleHandle {
        self.subscribe(event, Some(Box::new(condition)), Box::new(action))
    }

    fn subscribe(
        &self,
        event: SimEvent,
        condition: Option<Condition>,
        action: Action,
    ) -> RuleHandle {
        let mut table = self.rules.borrow_mut();
        let id = table.next_id;
        table.next_id += 1;
        table.rules[event.index()].push(Rule {
            id,
            cancelled: false,
            condition,
            action: Some(action),
        });
        RuleHandle { event, id }
    }

    /// Cancel a rule. Idempotent; a cancelled rule is skipped if the
    /// current dispatch has not reached it yet.
    pub fn cancel(&self, handle: RuleHandle) {
        let mut table = self.rules.borrow_mut();
        if let Some(rule) = table.rules[handle.event.index()]
            .iter_mut()
            .find(|r| r.id == handle.id)
        {
            rule.cancelled = true;
        }
    }

    /// Fire `event`: run the live rules in insertion order. Rules added
    /// during the dispatch run in the same pass, after the rule that
    /// added them completes.
    pub fn emit(&self, event: SimEvent) {
        let slot = event.index();
        let mut idx = 0;
        loop {
            // Take the rule's closures out so user code may re-borrow
            // the table (add or cancel rules) while it runs.
            let (id, condition, mut action) = {
                let mut table = self.rules.borrow_mut();
                let list = &mut table.rules[slot];
                if idx >= list.len() {
                    break;
                }
                let rule = &mut list[idx];
                if rule.cancelled || rule.action.is_none() {
                    idx += 1;
                    continue;
                }
                (rule.id, rule.condition.take(), rule.action.take())
            };

            let fire = condition.as_ref().map_or(true, |c| c(self));
            if fire {
                if let Some(a) = action.as_mut() {
                    a(self);
                }
            }

            // Restore the closures; the slot cannot have moved, only
            // appends happen during a dispatch.
            {
                let mut table = self.rules.borrow_mut();
                let rule = &mut table.rules[slot][idx];
                debug_assert_eq!(rule.id, id);
                rule.condition = condition;
                rule.action = action;
            }
            idx += 1;
        }
    }

    /// Install the data feed consumed by [`run`](Self::run).
    pub fn data_feed(&self, source: Box<dyn DataSource>) {
        *self.source.borrow_mut() = Some(source);
    }

    /// The record currently being dispatched. Panics outside
    /// `StartRecord`/`EndRecord`.
    pub fn stream_record(&self) -> Record {
        self.current.get().expect("no record under dispatch")
    }

    /// Records replayed before the protocol starts.
    pub fn set_warmup(&self, records: Vec<Record>) {
        *self.warmup.borrow_mut() = records;
    }

    pub fn with_warmup<R>(&self, f: impl FnOnce(&[Record]) -> R) -> R {
        f(&self.warmup.borrow())
    }

    pub fn set_metadata(&self, meta: DsMetadata) {
        *self.metadata.borrow_mut() = Some(meta);
    }

    /// Metadata of the installed dataset. Panics before the dataset is
    /// created.
    pub fn metadata(&self) -> DsMetadata {
        self.metadata
            .borrow()
            .clone()
            .expect("no dataset installed")
    }

    /// Number of records dispatched so far.
    pub fn stream_count(&self) -> usize {
        self.stream_count.get()
    }

    pub fn with_outputs<R>(&self, f: impl FnOnce(&mut ResultSet) -> R) -> R {
        f(&mut self.outputs.borrow_mut())
    }

    /// Run the simulation to completion: INIT, START_STREAM, one
    /// START_RECORD/END_RECORD pair per record, then END_STREAM, REPORT,
    /// RESULTS and DONE. Result files are flushed and closed on exit.
    pub fn run(&self) {
        self.emit(SimEvent::Init);
        self.emit(SimEvent::StartStream);
        loop {
            let rec = {
                let mut src = self.source.borrow_mut();
                match src.as_mut() {
                    Some(s) if s.valid() => s.get(),
                    _ => break,
                }
            };
            self.current.set(Some(rec));
            self.emit(SimEvent::StartRecord);
            self.emit(SimEvent::EndRecord);
            self.current.set(None);
            self.stream_count.set(self.stream_count.get() + 1);
            if let Some(s) = self.source.borrow_mut().as_mut() {
                s.advance();
            }
        }
        debug!(records = self.stream_count.get(), "stream exhausted");
        self.emit(SimEvent::EndStream);
        self.emit(SimEvent::Report);
        self.emit(SimEvent::Results);
        self.emit(SimEvent::Done);
        self.outputs.borrow_mut().close_all();
    }
}
