use bitflags::bitflags;

use super::{LevelHierarchy, PASS_COUNT, RADIX_BITS};

/// One of the two element buffers the sort ping-pongs between.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferSlot {
    /// The buffer passed as input by the caller. Holds the sorted result once
    /// the sort completes.
    #[default]
    Primary,
    /// The scratch buffer passed as output by the caller.
    Secondary,
}

impl BufferSlot {
    /// The other slot of the pair.
    #[inline]
    pub fn other(self) -> Self {
        match self {
            BufferSlot::Primary => BufferSlot::Secondary,
            BufferSlot::Secondary => BufferSlot::Primary,
        }
    }
}

/// Current roles of the two buffer slots.
///
/// A single role bit; flipping it swaps which slot is read and which is
/// written by the next reorder, without touching the buffers themselves.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PingPong {
    flipped: bool,
}

impl PingPong {
    /// Slot read by the current pass.
    #[inline]
    pub fn input(&self) -> BufferSlot {
        if self.flipped {
            BufferSlot::Secondary
        } else {
            BufferSlot::Primary
        }
    }

    /// Slot written by the current pass.
    #[inline]
    pub fn output(&self) -> BufferSlot {
        self.input().other()
    }

    /// Swap the roles, after a pass completed.
    #[inline]
    pub fn flip(&mut self) {
        self.flipped = !self.flipped;
    }
}

bitflags! {
    /// Memory made visible by a barrier to the commands following it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SortBarrier: u8 {
        /// Storage buffer writes are visible to subsequent compute reads.
        const STORAGE = 0b01;
        /// Element buffer writes are visible to vertex fetching.
        const VERTEX_INPUT = 0b10;
    }
}

/// Compute kernel of the sort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SortKernel {
    /// Scan level 0: derive digits (projecting keys on the first pass),
    /// write the flags and per-block scan of the elements.
    ScanFirst,
    /// Scan the block sums of the level below.
    Scan,
    /// Add the resolved scan of a level into the blocks of the level below.
    Resolve,
    /// Scatter elements and keys to their destination in the output buffer.
    Reorder,
}

/// A kernel invocation over a grid of workgroups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dispatch {
    /// Kernel to run.
    pub kernel: SortKernel,
    /// Digit pass, in `0..PASS_COUNT`.
    pub pass: u32,
    /// Level the kernel operates on.
    ///
    /// For [`SortKernel::Resolve`] this is the parent level `i` whose scan is
    /// added into level `i - 1`.
    pub level: u32,
    /// Number of workgroups of `B` lanes.
    pub workgroups: u32,
    /// Element buffer slot read by the pass.
    pub input: BufferSlot,
}

impl Dispatch {
    /// First key bit of the digit sorted by this dispatch's pass.
    #[inline]
    pub fn bit_offset(&self) -> u32 {
        self.pass * RADIX_BITS
    }

    /// Whether the dispatch derives the element keys from their records.
    #[inline]
    pub fn projects_keys(&self) -> bool {
        self.kernel == SortKernel::ScanFirst && self.pass == 0
    }

    /// Element buffer slot written by the pass.
    #[inline]
    pub fn output(&self) -> BufferSlot {
        self.input.other()
    }
}

/// Entry of the sort command list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SortCommand {
    /// Run a kernel.
    Dispatch(Dispatch),
    /// Wait for all previous dispatches and make their writes visible.
    Barrier(SortBarrier),
}

/// Full command list of one sort, shared by all execution devices.
///
/// Every pass is
///
/// ```text
/// ScanFirst, barrier,
/// (Scan level i, barrier) for i in 1..L,
/// (Resolve level i, barrier) for i in L-1..=1,
/// Reorder, barrier
/// ```
///
/// after which the buffer roles flip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortSchedule {
    commands: Vec<SortCommand>,
    result: BufferSlot,
}

impl SortSchedule {
    /// Build the schedule of all passes for a hierarchy.
    pub fn new(hierarchy: &LevelHierarchy) -> Self {
        let levels = hierarchy.levels();
        let mut commands = vec![];
        let mut roles = PingPong::default();
        for pass in 0..PASS_COUNT {
            let input = roles.input();
            let dispatch = |kernel, level: usize, workgroups| {
                SortCommand::Dispatch(Dispatch {
                    kernel,
                    pass,
                    level: level as u32,
                    workgroups,
                    input,
                })
            };
            let storage = SortCommand::Barrier(SortBarrier::STORAGE);

            commands.push(dispatch(SortKernel::ScanFirst, 0, levels[0].block_count));
            commands.push(storage);
            for (index, level) in levels.iter().enumerate().skip(1) {
                commands.push(dispatch(SortKernel::Scan, index, level.block_count));
                commands.push(storage);
            }
            for index in (1..levels.len()).rev() {
                let child = &levels[index - 1];
                commands.push(dispatch(SortKernel::Resolve, index, child.block_count));
                commands.push(storage);
            }
            commands.push(dispatch(SortKernel::Reorder, 0, levels[0].block_count));
            let barrier = if pass + 1 == PASS_COUNT {
                SortBarrier::STORAGE | SortBarrier::VERTEX_INPUT
            } else {
                SortBarrier::STORAGE
            };
            commands.push(SortCommand::Barrier(barrier));

            roles.flip();
        }
        Self {
            commands,
            result: roles.input(),
        }
    }

    /// All commands, in submission order.
    #[inline]
    pub fn commands(&self) -> &[SortCommand] {
        &self.commands
    }

    /// Iterate over the dispatches only.
    pub fn dispatches(&self) -> impl Iterator<Item = &Dispatch> {
        self.commands.iter().filter_map(|command| match command {
            SortCommand::Dispatch(dispatch) => Some(dispatch),
            SortCommand::Barrier(_) => None,
        })
    }

    /// Slot holding the sorted elements once all commands completed.
    #[inline]
    pub fn result(&self) -> BufferSlot {
        self.result
    }
}
