//! Sequential command runner.
//!
//! Runs a queue of commands against a [`CommandChannel`], either strictly one
//! after another or in windows of commands that may be outstanding together.
//! The first failure aborts the remaining sequence.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::mem;
use std::rc::Rc;

use smallvec::SmallVec;
use tracing::{debug, warn};

use super::*;


/// Sequence status callback.
pub type StatusCallback = Box<dyn FnOnce(Result<()>)>;

/// Per-command completion callback. Called with the terminal event of a
/// successful command.
pub type SeqCallback = Box<dyn FnOnce(&EventPacket)>;

/// Command queued in a [`SequentialCommandRunner`].
#[must_use]
pub struct SeqCommand {
    pkt: CommandPacket,
    completion: Completion,
    exclusions: SmallVec<[Opcode; 2]>,
    wait: bool,
    cb: Option<SeqCallback>,
}

impl SeqCommand {
    /// Creates a synchronous command that must complete before the next
    /// command is sent.
    #[inline]
    pub fn new(pkt: CommandPacket) -> Self {
        Self {
            pkt,
            completion: Completion::Sync,
            exclusions: SmallVec::new(),
            wait: true,
            cb: None,
        }
    }

    /// Sets the event that completes the command.
    #[inline]
    pub fn completion(mut self, code: EventCode) -> Self {
        self.completion = Completion::from_code(code);
        self
    }

    /// Sets the LE meta subevent that completes the command.
    #[inline]
    pub fn le_async(mut self, subevent: SubeventCode) -> Self {
        self.completion = Completion::LeAsync(subevent);
        self
    }

    /// Allows the following commands to be sent before this one completes.
    #[inline]
    pub fn no_wait(mut self) -> Self {
        self.wait = false;
        self
    }

    /// Sets the opcodes that may not be outstanding when the command is sent.
    #[inline]
    pub fn exclusions(mut self, ops: &[Opcode]) -> Self {
        self.exclusions = SmallVec::from_slice(ops);
        self
    }

    /// Sets the completion callback.
    #[inline]
    pub fn callback(mut self, f: impl FnOnce(&EventPacket) + 'static) -> Self {
        self.cb = Some(Box::new(f));
        self
    }
}

impl Debug for SeqCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeqCommand")
            .field("opcode", &self.pkt.opcode())
            .field("completion", &self.completion)
            .field("wait", &self.wait)
            .finish_non_exhaustive()
    }
}

/// Single-use-per-sequence command runner. Dropping the runner discards all
/// pending results without calling any callbacks.
pub struct SequentialCommandRunner(Rc<Inner>);

struct Inner {
    cmd: CommandChannel,
    state: RefCell<State>,
}

#[derive(Default)]
struct State {
    closed: bool,
    /// Sequence number that invalidates the results of commands sent by a
    /// canceled or finished sequence.
    seq: u64,
    queue: VecDeque<SeqCommand>,
    running: usize,
    running_wait: usize,
    status_cb: Option<StatusCallback>,
}

impl SequentialCommandRunner {
    /// Creates a runner for channel `cmd`.
    #[inline]
    #[must_use]
    pub fn new(cmd: CommandChannel) -> Self {
        Self(Rc::new(Inner {
            cmd,
            state: RefCell::default(),
        }))
    }

    /// Appends a command to the queue. Commands queued while a sequence is
    /// running become part of that sequence.
    #[inline]
    pub fn queue(&self, c: SeqCommand) {
        self.0.state.borrow_mut().queue.push_back(c);
    }

    /// Appends a synchronous command with a completion callback.
    #[inline]
    pub fn queue_command(&self, pkt: CommandPacket, f: impl FnOnce(&EventPacket) + 'static) {
        self.queue(SeqCommand::new(pkt).callback(f));
    }

    /// Returns whether a sequence can be started, which is the case when no
    /// sequence is running.
    #[inline]
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.0.state.borrow().status_cb.is_none()
    }

    /// Returns whether any commands are queued and not yet sent.
    #[inline]
    #[must_use]
    pub fn has_queued_commands(&self) -> bool {
        !self.0.state.borrow().queue.is_empty()
    }

    /// Starts sending the queued commands. `f` is called once with the result
    /// of the sequence.
    ///
    /// # Panics
    ///
    /// Panics if a sequence is already running or there are no queued
    /// commands.
    pub fn run_commands(&self, f: impl FnOnce(Result<()>) + 'static) {
        {
            let mut s = self.0.state.borrow_mut();
            assert!(s.status_cb.is_none(), "command sequence already running");
            assert!(!s.queue.is_empty(), "no commands to run");
            s.seq += 1;
            s.status_cb = Some(Box::new(f));
            debug!("Running {} commands [seq={}]", s.queue.len(), s.seq);
        }
        try_send_next(&self.0);
    }

    /// Discards all queued commands and reports [`Error::Canceled`] to the
    /// status callback. Results of commands that were already sent are
    /// ignored.
    pub fn cancel(&self) {
        if self.is_ready() {
            let dropped = mem::take(&mut self.0.state.borrow_mut().queue);
            drop(dropped);
            return;
        }
        debug!("Command sequence canceled");
        finish(&self.0, Err(Error::Canceled));
    }
}

impl Drop for SequentialCommandRunner {
    fn drop(&mut self) {
        let dropped = {
            let mut s = self.0.state.borrow_mut();
            s.closed = true;
            s.seq += 1;
            (mem::take(&mut s.queue), s.status_cb.take())
        };
        drop(dropped);
    }
}

impl Debug for SequentialCommandRunner {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = self.0.state.borrow();
        f.debug_struct("SequentialCommandRunner")
            .field("seq", &s.seq)
            .field("queued", &s.queue.len())
            .field("running", &s.running)
            .field("ready", &s.status_cb.is_none())
            .finish()
    }
}

/// Sends commands from the front of the queue until a command must wait for
/// its predecessors or the queue is empty.
fn try_send_next(inner: &Rc<Inner>) {
    loop {
        let (seq, c) = {
            let mut s = inner.state.borrow_mut();
            if s.closed || s.status_cb.is_none() {
                return;
            }
            if s.queue.is_empty() {
                let done = s.running == 0;
                drop(s);
                if done {
                    finish(inner, Ok(()));
                }
                return;
            }
            let wait = s.queue.front().map_or(false, |c| c.wait);
            if s.running_wait > 0 || (wait && s.running > 0) {
                return;
            }
            let Some(c) = s.queue.pop_front() else { return };
            s.running += 1;
            s.running_wait += usize::from(c.wait);
            (s.seq, c)
        };
        let SeqCommand {
            pkt,
            completion,
            exclusions,
            wait,
            mut cb,
        } = c;
        let opcode = pkt.opcode();
        let weak = Rc::downgrade(inner);
        let r = inner.cmd.send(
            pkt,
            completion,
            &exclusions,
            Box::new(move |_: TransactionId, evt: &EventPacket| {
                if let Some(inner) = weak.upgrade() {
                    on_event(&inner, seq, opcode, completion, wait, &mut cb, evt);
                }
            }),
        );
        if let Err(e) = r {
            warn!("Failed to send {opcode} command: {e}");
            finish(inner, Err(e));
            return;
        }
    }
}

/// Handles an event of a command sent by sequence `seq`.
fn on_event(
    inner: &Rc<Inner>,
    seq: u64,
    opcode: Opcode,
    completion: Completion,
    wait: bool,
    cb: &mut Option<SeqCallback>,
    evt: &EventPacket,
) {
    if !is_current(inner, seq) {
        return;
    }
    let status = evt.status();
    if !status.is_ok() {
        warn!("{opcode} command failed: {status}");
        return finish(inner, Err(Error::CommandFailed { opcode, status }));
    }
    if evt.code() == EventCode::COMMAND_STATUS && completion != Completion::Sync {
        return;
    }
    {
        let mut s = inner.state.borrow_mut();
        s.running -= 1;
        s.running_wait -= usize::from(wait);
    }
    if let Some(f) = cb.take() {
        f(evt);
    }
    // The callback may have dropped, canceled, or restarted the runner
    if is_current(inner, seq) {
        try_send_next(inner);
    }
}

/// Returns whether the runner is still executing sequence `seq`.
#[inline]
fn is_current(inner: &Inner, seq: u64) -> bool {
    let s = inner.state.borrow();
    !s.closed && s.seq == seq
}

/// Ends the current sequence and reports its result.
fn finish(inner: &Inner, r: Result<()>) {
    let (f, dropped) = {
        let mut s = inner.state.borrow_mut();
        s.seq += 1;
        s.running = 0;
        s.running_wait = 0;
        (s.status_cb.take(), mem::take(&mut s.queue))
    };
    drop(dropped);
    if let Some(f) = f {
        f(r);
    }
}
