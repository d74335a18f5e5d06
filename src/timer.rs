//! Hashed timer wheel for connection and stream deadlines.
//!
//! Scheduling and cancellation are O(1): an entry lives in a slab and its
//! slot only keeps `(index, generation)`. Cancelling bumps the generation,
//! so a stale slot reference is skipped at fire time and a cancelled timer
//! can never fire.

/// Monotonic time in microseconds, supplied by the caller.
pub type Instant = u64;

pub const DEFAULT_TICK_US: u64 = 10_000;
pub const DEFAULT_SLOTS: usize = 512;

/// Handle returned by [`TimerWheel::schedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct Entry<T> {
    generation: u32,
    armed: Option<(u64, T)>,
}

#[derive(Debug)]
pub struct TimerWheel<T> {
    slots: Vec<Vec<(u32, u32)>>,
    entries: Vec<Entry<T>>,
    free: Vec<u32>,
    tick_us: u64,
    /// Next tick to process.
    current: u64,
    len: usize,
}

impl<T> TimerWheel<T> {
    pub fn new(tick_us: u64, slots: usize, now: Instant) -> Self {
        let tick_us = tick_us.max(1);
        Self {
            slots: (0..slots.max(1)).map(|_| Vec::new()).collect(),
            entries: Vec::new(),
            free: Vec::new(),
            tick_us,
            current: now / tick_us,
            len: 0,
        }
    }

    /// Arm a timer firing at or after `deadline`.
    pub fn schedule(&mut self, deadline: Instant, payload: T) -> TimerId {
        let tick = deadline.div_ceil(self.tick_us).max(self.current);
        let index = match self.free.pop() {
            Some(i) => i,
            None => {
                self.entries.push(Entry { generation: 0, armed: None });
                (self.entries.len() - 1) as u32
            }
        };
        let entry = &mut self.entries[index as usize];
        entry.armed = Some((tick, payload));
        let generation = entry.generation;
        let slot = (tick % self.slots.len() as u64) as usize;
        self.slots[slot].push((index, generation));
        self.len += 1;
        TimerId { index, generation }
    }

    /// Disarm a timer. Returns its payload if it had not fired yet.
    pub fn cancel(&mut self, id: TimerId) -> Option<T> {
        let entry = self.entries.get_mut(id.index as usize)?;
        if entry.generation != id.generation {
            return None;
        }
        let (_, payload) = entry.armed.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(id.index);
        self.len -= 1;
        Some(payload)
    }

    /// Fire every timer due at `now`, appending payloads to `fired`.
    pub fn advance(&mut self, now: Instant, fired: &mut Vec<T>) {
        let now_tick = now / self.tick_us;
        if now_tick < self.current {
            return;
        }
        let n = self.slots.len() as u64;
        // One full rotation visits every slot.
        let last = now_tick.min(self.current + n - 1);
        for tick in self.current..=last {
            let slot = (tick % n) as usize;
            let mut pending = core::mem::take(&mut self.slots[slot]);
            pending.retain(|&(index, generation)| {
                let entry = &mut self.entries[index as usize];
                if entry.generation != generation {
                    return false;
                }
                match &entry.armed {
                    Some((deadline, _)) if *deadline <= now_tick => {
                        if let Some((_, payload)) = entry.armed.take() {
                            fired.push(payload);
                        }
                        entry.generation = entry.generation.wrapping_add(1);
                        self.free.push(index);
                        self.len -= 1;
                        false
                    }
                    Some(_) => true,
                    None => false,
                }
            });
            self.slots[slot] = pending;
        }
        self.current = now_tick + 1;
    }

    /// Earliest armed deadline, rounded to the tick. Slots are walked
    /// forward from the cursor, so the first match within one rotation is
    /// the answer; later rotations are only compared when that finds none.
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.len == 0 {
            return None;
        }
        let n = self.slots.len() as u64;
        let mut later: Option<u64> = None;
        for tick in self.current..self.current + n {
            for &(index, generation) in &self.slots[(tick % n) as usize] {
                let entry = &self.entries[index as usize];
                if entry.generation != generation {
                    continue;
                }
                match &entry.armed {
                    Some((deadline, _)) if *deadline == tick => return Some(tick * self.tick_us),
                    Some((deadline, _)) => later = Some(later.map_or(*deadline, |l| l.min(*deadline))),
                    None => {}
                }
            }
        }
        later.map(|tick| tick * self.tick_us)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
