//! Thread-per-actor runtime.
//!
//! Each actor owns one named thread and one unbounded crossbeam mailbox.
//! Messages are handled one at a time in send order. An optional idle hook
//! runs whenever the idle timeout elapses, even under steady traffic
//! (deadline based), which is what drives render ticks and cache admission.
//!
//! Handler errors and panics never reach the sender: they are wrapped in an
//! [`ErrorReport`] and forwarded to the error recipient given at spawn time.
//!
//! Replies use [`Recipient<T>`]: a closure that wraps a value into the
//! receiving actor's message enum and enqueues it (continuation passing).
//!
//! # Example
//! ```ignore
//! let handle = actor::spawn("stepframe-fetcher", errors, move |_addr| {
//!     FrameFetcher::new(path, decoders)
//! })?;
//! handle.addr().send(FetcherMsg::Info(MediaInfoRequest { reply }));
//! handle.shutdown(Duration::from_millis(500));
//! ```

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, Sender, unbounded};
use log::{debug, error, trace};

use crate::error::{EngineError, Result};

/// Error forwarded from an actor to its error handler
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorReport {
    pub actor: &'static str,
    pub error: EngineError,
}

enum Envelope<M> {
    Msg(M),
    Stop,
}

/// Sending half of an actor's mailbox
pub struct Addr<M> {
    name: &'static str,
    tx: Sender<Envelope<M>>,
}

impl<M> Clone for Addr<M> {
    fn clone(&self) -> Self {
        Self { name: self.name, tx: self.tx.clone() }
    }
}

impl<M> fmt::Debug for Addr<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Addr({})", self.name)
    }
}

impl<M: Send + 'static> Addr<M> {
    /// Enqueue a message. Never blocks; false once the actor has exited.
    pub fn send(&self, msg: M) -> bool {
        self.tx.send(Envelope::Msg(msg)).is_ok()
    }

    /// Enqueue the terminal signal. Messages sent earlier are still handled.
    pub fn stop(&self) {
        let _ = self.tx.send(Envelope::Stop);
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Typed responder that maps `T` into this actor's protocol
    pub fn recipient<T, F>(&self, wrap: F) -> Recipient<T>
    where
        F: Fn(T) -> M + Send + Sync + 'static,
    {
        let addr = self.clone();
        Recipient::from_fn(self.name, move |value| addr.send(wrap(value)))
    }
}

/// Type-erased reply target
pub struct Recipient<T> {
    name: &'static str,
    deliver: Arc<dyn Fn(T) -> bool + Send + Sync>,
}

impl<T> Clone for Recipient<T> {
    fn clone(&self) -> Self {
        Self { name: self.name, deliver: Arc::clone(&self.deliver) }
    }
}

impl<T> fmt::Debug for Recipient<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Recipient({})", self.name)
    }
}

impl<T> Recipient<T> {
    pub fn from_fn<F>(name: &'static str, deliver: F) -> Self
    where
        F: Fn(T) -> bool + Send + Sync + 'static,
    {
        Self { name, deliver: Arc::new(deliver) }
    }

    /// Deliver into a plain channel (event streams, tests)
    pub fn from_sender(name: &'static str, tx: Sender<T>) -> Self
    where
        T: Send + 'static,
    {
        Self::from_fn(name, move |value| tx.send(value).is_ok())
    }

    /// Drops everything it receives
    pub fn sink(name: &'static str) -> Self {
        Self::from_fn(name, |_| true)
    }

    /// Returns false when the receiver is gone (value dropped)
    pub fn send(&self, value: T) -> bool {
        (self.deliver)(value)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Per-actor runtime state passed to every hook
pub struct Context<M> {
    addr: Addr<M>,
    errors: Recipient<ErrorReport>,
    stop_requested: bool,
}

impl<M: Send + 'static> Context<M> {
    pub fn addr(&self) -> &Addr<M> {
        &self.addr
    }

    /// Forward an error to the error handler
    pub fn report(&self, error: EngineError) {
        trace!("{}: reporting {}", self.addr.name, error);
        self.errors.send(ErrorReport { actor: self.addr.name, error });
    }

    /// Exit after the current hook returns
    pub fn stop(&mut self) {
        self.stop_requested = true;
    }
}

/// Behaviour run on an actor thread
pub trait Actor: 'static {
    type Msg: Send + 'static;

    /// Init hook, runs once on the actor thread before any message
    fn started(&mut self, _ctx: &mut Context<Self::Msg>) {}

    fn handle(&mut self, msg: Self::Msg, ctx: &mut Context<Self::Msg>) -> Result<()>;

    /// Period of the idle hook; `None` disables it
    fn idle_timeout(&self) -> Option<Duration> {
        None
    }

    fn idle(&mut self, _ctx: &mut Context<Self::Msg>) -> Result<()> {
        Ok(())
    }

    /// Destruct hook: release native resources here
    fn stopped(&mut self) {}
}

/// Owner handle of a running actor
pub struct ActorHandle<M: Send + 'static> {
    addr: Addr<M>,
    thread: Option<JoinHandle<()>>,
}

impl<M: Send + 'static> ActorHandle<M> {
    pub fn addr(&self) -> &Addr<M> {
        &self.addr
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(|t| t.is_finished())
    }

    /// Stop and wait for the thread up to `timeout`.
    ///
    /// Returns false when the deadline passed; the thread is then detached.
    pub fn shutdown(mut self, timeout: Duration) -> bool {
        self.addr.stop();
        let Some(thread) = self.thread.take() else {
            return true;
        };

        let deadline = Instant::now() + timeout;
        while !thread.is_finished() {
            if Instant::now() >= deadline {
                debug!("{}: shutdown timeout reached, detaching", self.addr.name);
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        let _ = thread.join();
        trace!("{}: stopped gracefully", self.addr.name);
        true
    }
}

impl<M: Send + 'static> Drop for ActorHandle<M> {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.addr.stop();
        }
    }
}

/// Spawn an actor on a new named thread.
///
/// `make` runs on that thread, so the actor itself need not be `Send`.
/// It receives the actor's own address for building reply recipients.
pub fn spawn<A, F>(
    name: &'static str,
    errors: Recipient<ErrorReport>,
    make: F,
) -> Result<ActorHandle<A::Msg>>
where
    A: Actor,
    F: FnOnce(&Addr<A::Msg>) -> A + Send + 'static,
{
    let (tx, rx) = unbounded::<Envelope<A::Msg>>();
    let addr = Addr { name, tx };
    let thread_addr = addr.clone();

    let thread = thread::Builder::new().name(name.to_string()).spawn(move || {
        let mut ctx = Context { addr: thread_addr, errors, stop_requested: false };

        let mut actor = match catch_unwind(AssertUnwindSafe(|| make(&ctx.addr))) {
            Ok(actor) => actor,
            Err(payload) => {
                report_panic(&ctx, payload);
                return;
            }
        };
        trace!("{} started", name);

        if catch_unwind(AssertUnwindSafe(|| actor.started(&mut ctx))).is_err() {
            ctx.report(EngineError::ActorPanicked {
                actor: name,
                message: "init hook panicked".into(),
            });
            finish(&mut actor, name);
            return;
        }

        let period = actor.idle_timeout();
        let mut next_idle = period.map(|p| Instant::now() + p);

        while !ctx.stop_requested {
            let envelope = match next_idle {
                Some(deadline) => match rx.recv_deadline(deadline) {
                    Ok(envelope) => Some(envelope),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                None => match rx.recv() {
                    Ok(envelope) => Some(envelope),
                    Err(_) => break,
                },
            };

            match envelope {
                Some(Envelope::Msg(msg)) => {
                    match catch_unwind(AssertUnwindSafe(|| actor.handle(msg, &mut ctx))) {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => ctx.report(e),
                        Err(payload) => {
                            report_panic(&ctx, payload);
                            break;
                        }
                    }
                }
                Some(Envelope::Stop) => break,
                None => {}
            }

            if let (Some(p), Some(deadline)) = (period, next_idle) {
                let now = Instant::now();
                if now >= deadline && !ctx.stop_requested {
                    match catch_unwind(AssertUnwindSafe(|| actor.idle(&mut ctx))) {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => ctx.report(e),
                        Err(payload) => {
                            report_panic(&ctx, payload);
                            break;
                        }
                    }
                    next_idle = Some(now + p);
                }
            }
        }

        finish(&mut actor, name);
    })?;

    Ok(ActorHandle { addr, thread: Some(thread) })
}

/// Receiving end of an address with no actor behind it
#[cfg(test)]
pub(crate) struct Mailbox<M> {
    rx: crossbeam_channel::Receiver<Envelope<M>>,
}

#[cfg(test)]
impl<M> Mailbox<M> {
    /// Messages received so far (stop signals skipped)
    pub fn drain(&self) -> Vec<M> {
        self.rx
            .try_iter()
            .filter_map(|envelope| match envelope {
                Envelope::Msg(msg) => Some(msg),
                Envelope::Stop => None,
            })
            .collect()
    }
}

#[cfg(test)]
pub(crate) fn mailbox<M>(name: &'static str) -> (Addr<M>, Mailbox<M>) {
    let (tx, rx) = unbounded();
    (Addr { name, tx }, Mailbox { rx })
}

fn finish<A: Actor>(actor: &mut A, name: &'static str) {
    if catch_unwind(AssertUnwindSafe(|| actor.stopped())).is_err() {
        error!("{}: destruct hook panicked", name);
    }
    trace!("{} stopped", name);
}

fn report_panic<M: Send + 'static>(ctx: &Context<M>, payload: Box<dyn Any + Send>) {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    };
    error!("{} panicked: {}", ctx.addr.name, message);
    ctx.report(EngineError::ActorPanicked { actor: ctx.addr.name, message });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::Receiver;

    enum EchoMsg {
        Push(u32),
        Fail,
        Panic,
        Quit,
    }

    struct Echo {
        out: Sender<u32>,
        ticks: Sender<()>,
        period: Option<Duration>,
    }

    impl Actor for Echo {
        type Msg = EchoMsg;

        fn handle(&mut self, msg: EchoMsg, ctx: &mut Context<EchoMsg>) -> Result<()> {
            match msg {
                EchoMsg::Push(v) => {
                    let _ = self.out.send(v);
                    Ok(())
                }
                EchoMsg::Fail => Err(EngineError::Decode("bad".into())),
                EchoMsg::Panic => panic!("boom"),
                EchoMsg::Quit => {
                    ctx.stop();
                    Ok(())
                }
            }
        }

        fn idle_timeout(&self) -> Option<Duration> {
            self.period
        }

        fn idle(&mut self, _ctx: &mut Context<EchoMsg>) -> Result<()> {
            let _ = self.ticks.send(());
            Ok(())
        }

        fn stopped(&mut self) {
            let _ = self.out.send(u32::MAX);
        }
    }

    fn start(
        period: Option<Duration>,
    ) -> (ActorHandle<EchoMsg>, Receiver<u32>, Receiver<()>, Receiver<ErrorReport>) {
        let (out_tx, out_rx) = unbounded();
        let (tick_tx, tick_rx) = unbounded();
        let (err_tx, err_rx) = unbounded();
        let handle = spawn("test-echo", Recipient::from_sender("errors", err_tx), move |_| Echo {
            out: out_tx,
            ticks: tick_tx,
            period,
        })
        .expect("spawn");
        (handle, out_rx, tick_rx, err_rx)
    }

    #[test]
    fn test_messages_handled_in_order() {
        let (handle, out, _ticks, _errors) = start(None);
        for i in 0..100 {
            handle.addr().send(EchoMsg::Push(i));
        }
        for i in 0..100 {
            assert_eq!(out.recv_timeout(Duration::from_secs(1)), Ok(i));
        }
        assert!(handle.shutdown(Duration::from_secs(1)));
        assert_eq!(out.recv_timeout(Duration::from_secs(1)), Ok(u32::MAX));
    }

    #[test]
    fn test_errors_go_to_error_recipient() {
        let (handle, out, _ticks, errors) = start(None);
        handle.addr().send(EchoMsg::Fail);
        handle.addr().send(EchoMsg::Push(7));

        let report = errors.recv_timeout(Duration::from_secs(1)).expect("report");
        assert_eq!(report.actor, "test-echo");
        assert_eq!(report.error, EngineError::Decode("bad".into()));
        // actor keeps running after a handler error
        assert_eq!(out.recv_timeout(Duration::from_secs(1)), Ok(7));
        handle.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn test_panic_stops_actor_and_runs_destructor() {
        let (handle, out, _ticks, errors) = start(None);
        handle.addr().send(EchoMsg::Panic);

        let report = errors.recv_timeout(Duration::from_secs(1)).expect("report");
        assert!(matches!(report.error, EngineError::ActorPanicked { actor: "test-echo", .. }));
        assert_eq!(out.recv_timeout(Duration::from_secs(1)), Ok(u32::MAX));
        assert!(handle.shutdown(Duration::from_secs(1)));
    }

    #[test]
    fn test_idle_runs_under_steady_traffic() {
        let (handle, _out, ticks, _errors) = start(Some(Duration::from_millis(5)));
        let addr = handle.addr().clone();
        let spammer = thread::spawn(move || {
            let until = Instant::now() + Duration::from_millis(100);
            while Instant::now() < until {
                addr.send(EchoMsg::Push(1));
                thread::sleep(Duration::from_micros(200));
            }
        });
        assert!(ticks.recv_timeout(Duration::from_millis(500)).is_ok());
        spammer.join().expect("spammer");
        handle.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn test_context_stop_and_recipient_mapping() {
        let (handle, out, _ticks, _errors) = start(None);
        let push = handle.addr().recipient(EchoMsg::Push);
        assert!(push.send(3));
        handle.addr().send(EchoMsg::Quit);

        assert_eq!(out.recv_timeout(Duration::from_secs(1)), Ok(3));
        assert_eq!(out.recv_timeout(Duration::from_secs(1)), Ok(u32::MAX));
        // mailbox closed once the thread is gone
        let deadline = Instant::now() + Duration::from_secs(1);
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(!push.send(4));
    }
}
