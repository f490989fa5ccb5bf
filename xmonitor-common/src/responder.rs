//! The per-probe pipeline: validate, swap addressing, collect, compose,
//! decide.

use crate::buffer::{OutOfBounds, PacketBuf};
use crate::collector::{CollectError, Collector, Failure, MetricSource};
use crate::composer::{ComposeError, Composer, Overflow};
use crate::headers::{Envelope, MalformedPacket, Rejection};
use crate::registry::Registry;
use crate::ResponderConfig;

pub const XDP_ABORTED: u32 = 0;
pub const XDP_DROP: u32 = 1;
pub const XDP_PASS: u32 = 2;
pub const XDP_TX: u32 = 3;

/// Terminal action for one frame. Exactly one is reached per frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Send the frame back out of the interface it arrived on.
    Transmit,
    Drop,
    Abort,
    /// Hand the frame to the kernel stack unmodified.
    Pass,
}

impl Verdict {
    pub const fn xdp_action(self) -> u32 {
        match self {
            Verdict::Transmit => XDP_TX,
            Verdict::Drop => XDP_DROP,
            Verdict::Abort => XDP_ABORTED,
            Verdict::Pass => XDP_PASS,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reason {
    /// Every registry entry was collected.
    Complete,
    Malformed(MalformedPacket),
    NotProbe,
    /// An acquisition failed under the `Abort` policy.
    Acquire(Failure),
    /// An acquisition failed under the `Truncate` policy; the reply is partial.
    Truncated(Failure),
    Overflow(Overflow),
    Store(OutOfBounds),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Outcome {
    pub verdict: Verdict,
    pub reason: Reason,
    /// Blocks written into the payload.
    pub blocks: usize,
    pub payload_len: usize,
}

impl Outcome {
    const fn early(verdict: Verdict, reason: Reason) -> Self {
        Self {
            verdict,
            reason,
            blocks: 0,
            payload_len: 0,
        }
    }
}

/// Turn a received frame into a metric reply in place.
///
/// Headers are swapped on a copy and written back only when the verdict is
/// `Transmit`. A registry that cannot fit in the frame is detected before
/// any payload byte is written, so such frames pass unmodified. A store the
/// frame refuses after that point aborts the frame.
#[inline(always)]
pub fn respond<P, S>(
    pkt: &mut P,
    config: &ResponderConfig,
    registry: &Registry,
    source: &S,
) -> Outcome
where
    P: PacketBuf + ?Sized,
    S: MetricSource + ?Sized,
{
    let mut envelope = match Envelope::parse(&*pkt, config.probe_port) {
        Ok(envelope) => envelope,
        Err(Rejection::NotProbe) => return Outcome::early(Verdict::Pass, Reason::NotProbe),
        Err(Rejection::Malformed(err)) => {
            return Outcome::early(Verdict::Drop, Reason::Malformed(err))
        }
    };
    envelope.swap_addressing(config.reply_port);

    let entries = registry.entries();
    let mut composer = Composer::new(envelope.payload_offset(), pkt.len());
    if let Err(overflow) = composer.preflight(entries) {
        return Outcome::early(Verdict::Pass, Reason::Overflow(overflow));
    }

    let collector = Collector::new(source, config.direct_policy(), config.indirect_policy());
    let collected = collector.collect(entries, |_, block| composer.append(&mut *pkt, block));

    let (verdict, reason, blocks) = match collected {
        Ok(collection) => match collection.truncated {
            None => (Verdict::Transmit, Reason::Complete, collection.blocks),
            Some(failure) => (Verdict::Transmit, Reason::Truncated(failure), collection.blocks),
        },
        Err(CollectError::Fatal(failure)) => (Verdict::Abort, Reason::Acquire(failure), 0),
        Err(CollectError::Sink(ComposeError::Overflow(overflow))) => {
            (Verdict::Pass, Reason::Overflow(overflow), 0)
        }
        // Earlier blocks may already be in the payload, so the frame cannot
        // go up the stack as if untouched.
        Err(CollectError::Sink(ComposeError::Store(err))) => (Verdict::Abort, Reason::Store(err), 0),
    };

    if verdict == Verdict::Transmit {
        if let Err(err) = envelope.write_to(pkt) {
            return Outcome::early(Verdict::Abort, Reason::Store(err));
        }
    }

    Outcome {
        verdict,
        reason,
        blocks,
        payload_len: if verdict == Verdict::Transmit {
            composer.written()
        } else {
            0
        },
    }
}
