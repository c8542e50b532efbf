//! # Graphics Engine
//!
//! The GE runs display lists: streams of 32-bit words the CPU queues through
//! `sceGe_user`. Each word latches a register or triggers an action (draw,
//! jump, transfer). Lists run in FIFO order, one at a time:
//!
//! ```text
//!   sceGeListEnQueue ──▶ queue ──▶ [list pc ─────────────▶ stall]
//!                                      │ JUMP/CALL/RET         │
//!                                      ▼                       ▼
//!                                  GpuState ──PRIM──▶ RenderBackend
//!                                                      (framebuffer in VRAM)
//!   FINISH + END ──▶ list completed ──▶ kernel wakes GeListSync/GeDrawSync
//! ```
//!
//! A list never executes the word at its stall address; it stays queued as
//! stalled until the stall is moved with `sceGeListUpdateStallAddr`.

pub mod backend;
pub mod color;
pub mod commands;
pub mod pixel;
pub mod raster;
pub mod state;
pub mod texture;
pub mod vertex;

use std::collections::{HashSet, VecDeque};

use tracing::{debug, error, trace, warn};

use crate::config::Config;
use crate::memory::{Memory, VRAM_BASE};

use backend::{DrawCall, RenderBackend};
use color::PixelFormat;
use commands as cmd;
use pixel::RenderTarget;
use state::{CLUT_BYTES, GpuState};
use vertex::{Numeric, ScreenVertex, VertexLayout};

pub const MAX_DISPLAY_LISTS: usize = 64;
const CALL_STACK_DEPTH: usize = 2;
/// Commands executed per `process` call before yielding back to the CPU.
const COMMAND_BUDGET: usize = 200_000;

/// Status codes reported by `sceGeListSync`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListStatus {
    Completed,
    Queued,
    Drawing,
    Stalled,
}

impl ListStatus {
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::Completed => 0,
            Self::Queued => 1,
            Self::Drawing => 2,
            Self::Stalled => 3,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ReturnFrame {
    pc: u32,
    offset: u32,
}

#[derive(Clone, Debug)]
struct DisplayList {
    id: u32,
    start: u32,
    pc: u32,
    /// `0` means no stall.
    stall: u32,
    stack: Vec<ReturnFrame>,
    status: ListStatus,
    finished: bool,
    signal: Option<u32>,
}

enum Flow {
    Continue,
    Completed,
}

/// What `sceDisplay` shows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DisplayState {
    pub mode: u32,
    pub width: u32,
    pub height: u32,
    pub framebuffer: u32,
    pub stride: u32,
    pub format: PixelFormat,
}

impl Default for DisplayState {
    fn default() -> Self {
        Self {
            mode: 0,
            width: 480,
            height: 272,
            framebuffer: VRAM_BASE,
            stride: 512,
            format: PixelFormat::Rgb565,
        }
    }
}

pub struct Gpu {
    pub state: GpuState,
    pub display: DisplayState,
    lists: Vec<Option<DisplayList>>,
    queue: VecDeque<u32>,
    backend: Box<dyn RenderBackend>,
    target: Option<RenderTarget>,
    vertex_address: u32,
    index_address: u32,
    offset: u32,
    warned: HashSet<u8>,
    draws: u64,
}

impl Gpu {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self::with_backend(backend::create(config))
    }

    #[must_use]
    pub fn with_backend(backend: Box<dyn RenderBackend>) -> Self {
        debug!("GE renderer: {}", backend.name());
        Self {
            state: GpuState::new(),
            display: DisplayState::default(),
            lists: vec![None; MAX_DISPLAY_LISTS],
            queue: VecDeque::new(),
            backend,
            target: None,
            vertex_address: 0,
            index_address: 0,
            offset: 0,
            warned: HashSet::new(),
            draws: 0,
        }
    }

    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Primitives submitted since start-up.
    #[must_use]
    pub const fn draw_count(&self) -> u64 {
        self.draws
    }

    /// Queues a list. Returns its id, or `None` when every slot is taken.
    pub fn enqueue(&mut self, start: u32, stall: u32) -> Option<u32> {
        let slot = self.lists.iter().position(Option::is_none)?;
        let id = slot as u32;
        self.lists[slot] = Some(DisplayList {
            id,
            start,
            pc: start & 0x0FFF_FFFC,
            stall: stall & 0x0FFF_FFFC,
            stack: Vec::with_capacity(CALL_STACK_DEPTH),
            status: ListStatus::Queued,
            finished: false,
            signal: None,
        });
        self.queue.push_back(id);
        debug!("list {id} queued at {start:#010x}, stall {stall:#010x}");
        Some(id)
    }

    /// Same as [`Gpu::enqueue`] but runs the list before every other one.
    pub fn enqueue_head(&mut self, start: u32, stall: u32) -> Option<u32> {
        let id = self.enqueue(start, stall)?;
        self.queue.retain(|&queued| queued != id);
        self.queue.push_front(id);
        Some(id)
    }

    /// Drops a queued list. Returns `false` for an unknown id.
    pub fn dequeue(&mut self, id: u32) -> bool {
        let Some(slot) = self.lists.get_mut(id as usize) else {
            return false;
        };
        if slot.take().is_none() {
            return false;
        }
        self.queue.retain(|&queued| queued != id);
        true
    }

    /// Moves the stall address of a list. Returns `false` for an unknown id.
    pub fn update_stall(&mut self, id: u32, stall: u32) -> bool {
        let Some(list) = self.lists.get_mut(id as usize).and_then(Option::as_mut) else {
            return false;
        };
        list.stall = stall & 0x0FFF_FFFC;
        if list.status == ListStatus::Stalled {
            list.status = ListStatus::Queued;
        }
        trace!("list {id} stall -> {stall:#010x}");
        true
    }

    /// Status of a list. Lists that already completed report `Completed`.
    #[must_use]
    pub fn list_status(&self, id: u32) -> Option<ListStatus> {
        if id as usize >= MAX_DISPLAY_LISTS {
            return None;
        }
        Some(
            self.lists[id as usize]
                .as_ref()
                .map_or(ListStatus::Completed, |list| list.status),
        )
    }

    /// `true` when nothing is queued.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }

    /// Status of the GE as a whole, for `sceGeDrawSync`.
    #[must_use]
    pub fn draw_status(&self) -> ListStatus {
        let Some(&head) = self.queue.front() else {
            return ListStatus::Completed;
        };
        self.list_status(head).unwrap_or(ListStatus::Completed)
    }

    /// Tells the renderer that guest memory changed under it.
    pub fn invalidate_texture(&mut self, address: u32, size: u32) {
        self.backend.invalidate_texture(address, size);
    }

    pub fn end_frame(&mut self, frame: u64) {
        self.backend.end_frame(frame);
    }

    /// Runs queued lists until they complete or stall. Returns the ids of
    /// the lists that completed.
    pub fn process(&mut self, memory: &mut Memory) -> Vec<u32> {
        let mut completed = Vec::new();
        let mut budget = COMMAND_BUDGET;
        while let Some(&id) = self.queue.front() {
            let Some(mut list) = self.lists.get_mut(id as usize).and_then(Option::take) else {
                self.queue.pop_front();
                continue;
            };
            let done = self.run(memory, &mut list, &mut budget);
            if done {
                debug!("list {id} completed");
                self.queue.pop_front();
                completed.push(id);
                continue;
            }
            self.lists[id as usize] = Some(list);
            break;
        }
        completed
    }

    fn run(&mut self, memory: &mut Memory, list: &mut DisplayList, budget: &mut usize) -> bool {
        list.status = ListStatus::Drawing;
        loop {
            // Equality only: a jump or call past the stall address keeps running.
            if list.stall != 0 && list.pc == list.stall {
                trace!("list {} stalled at {:#010x}", list.id, list.pc);
                list.status = ListStatus::Stalled;
                return false;
            }
            if *budget == 0 {
                list.status = ListStatus::Queued;
                return false;
            }
            *budget -= 1;

            let word = memory.read_u32(list.pc);
            list.pc = list.pc.wrapping_add(4);
            let (command, data) = cmd::split(word);
            if let Flow::Completed = self.execute(memory, list, command, data) {
                list.status = ListStatus::Completed;
                return true;
            }
        }
    }

    fn base(&self) -> u32 {
        (self.state.regs[usize::from(cmd::BASE)] & 0x000F_0000) << 8
    }

    /// Resolves a 24-bit address payload against BASE and the offset.
    fn address(&self, data: u32) -> u32 {
        ((self.base() | data).wrapping_add(self.offset)) & 0x0FFF_FFFF
    }

    fn execute(&mut self, memory: &mut Memory, list: &mut DisplayList, command: u8, data: u32) -> Flow {
        match command {
            cmd::NOP => {}
            cmd::VADDR => self.vertex_address = self.address(data),
            cmd::IADDR => self.index_address = self.address(data),
            cmd::PRIM => self.draw_primitive(memory, data),
            cmd::JUMP => list.pc = self.address(data) & !3,
            cmd::BJUMP => trace!("bounding box jump ignored"),
            cmd::CALL => {
                if list.stack.len() < CALL_STACK_DEPTH {
                    list.stack.push(ReturnFrame {
                        pc: list.pc,
                        offset: self.offset,
                    });
                    list.pc = self.address(data) & !3;
                } else {
                    warn!("list {} call stack overflow at {:#010x}", list.id, list.pc);
                }
            }
            cmd::RET => match list.stack.pop() {
                Some(frame) => {
                    list.pc = frame.pc;
                    self.offset = frame.offset;
                }
                None => warn!("list {} returns with an empty call stack", list.id),
            },
            cmd::SIGNAL => {
                debug!("list {} signal {data:#x}", list.id);
                list.signal = Some(data);
            }
            cmd::FINISH => list.finished = true,
            cmd::END => {
                if list.finished {
                    return Flow::Completed;
                }
                if list.signal.take().is_none() {
                    warn!("list {} ends without FINISH at {:#010x}", list.id, list.pc);
                    return Flow::Completed;
                }
            }
            cmd::OFFSETADDR => self.offset = data << 8,
            cmd::ORIGIN => self.offset = list.pc.wrapping_sub(4),
            cmd::LOADCLUT => {
                self.state.apply(command, data);
                self.load_clut(memory, data);
            }
            cmd::TEXFLUSH => self.backend.clear_texture_cache(),
            cmd::TRANSFERSTART => {
                self.state.apply(command, data);
                self.block_transfer(memory);
            }
            cmd::BEZIER | cmd::SPLINE => self.warn_once(command, "curved surfaces are not supported"),
            _ => {
                self.state.apply(command, data);
            }
        }
        Flow::Continue
    }

    fn warn_once(&mut self, command: u8, message: &str) {
        if self.warned.insert(command) {
            warn!("GE command {command:#04x}: {message}");
        }
    }

    fn load_clut(&mut self, memory: &Memory, data: u32) {
        let len = ((data & 0x3F) * 32) as usize;
        let len = len.min(CLUT_BYTES);
        let address = self.state.clut_address();
        match memory.slice(address, len) {
            Some(bytes) => self.state.clut[..len].copy_from_slice(bytes),
            None => warn!("CLUT load from invalid address {address:#010x}"),
        }
    }

    fn block_transfer(&mut self, memory: &mut Memory) {
        let transfer = self.state.transfer();
        let bpp = transfer.bytes_per_pixel;
        let row_bytes = transfer.width * bpp;
        trace!(
            "block transfer {}x{} {:#010x} -> {:#010x}",
            transfer.width, transfer.height, transfer.src, transfer.dst
        );
        for row in 0..transfer.height {
            let src = transfer.src + ((transfer.src_y + row) * transfer.src_stride + transfer.src_x) * bpp;
            let dst = transfer.dst + ((transfer.dst_y + row) * transfer.dst_stride + transfer.dst_x) * bpp;
            let Some(bytes) = memory.slice(src, row_bytes as usize).map(<[u8]>::to_vec) else {
                warn!("block transfer reads outside memory at {src:#010x}");
                return;
            };
            if !memory.copy_from_slice(dst, &bytes) {
                warn!("block transfer writes outside memory at {dst:#010x}");
                return;
            }
        }
        let first = transfer.dst + (transfer.dst_y * transfer.dst_stride + transfer.dst_x) * bpp;
        let span = transfer.height.saturating_sub(1) * transfer.dst_stride * bpp + row_bytes;
        self.backend.invalidate_texture(first, span);
    }

    fn sync_framebuffer(&mut self) {
        let target = RenderTarget {
            color: self.state.framebuffer_address(),
            color_stride: self.state.framebuffer_stride(),
            format: self.state.framebuffer_format(),
            depth: self.state.depth_address(),
            depth_stride: self.state.depth_stride(),
        };
        if self.target != Some(target) {
            trace!("render target {target:?}");
            self.backend.set_framebuffer(target);
            self.target = Some(target);
        }
    }

    fn draw_primitive(&mut self, memory: &mut Memory, data: u32) {
        let count = data & 0xFFFF;
        let kind = (data >> 16) & 7;
        let layout = VertexLayout::new(self.state.regs[usize::from(cmd::VERTEXTYPE)]);
        let texture_size = if self.state.texture_enabled() {
            self.state.texture_size(0)
        } else {
            (1, 1)
        };

        let vertices: Vec<ScreenVertex> = (0..count)
            .map(|i| {
                let n = layout.read_index(memory, self.index_address, i);
                let raw = layout.read(memory, self.vertex_address, n);
                vertex::transform(&self.state, &layout, &raw, texture_size)
            })
            .collect();

        match layout.index {
            Numeric::None => self.vertex_address = self.vertex_address.wrapping_add(count * layout.size),
            Numeric::Byte => self.index_address = self.index_address.wrapping_add(count),
            Numeric::Short | Numeric::Float => self.index_address = self.index_address.wrapping_add(count * 2),
        }

        self.sync_framebuffer();
        self.draws += 1;
        let call = DrawCall {
            state: &self.state,
            through: layout.through,
        };
        let backend = &mut self.backend;
        match kind {
            3 => {
                let culling = call.culling();
                for triangle in vertices.chunks_exact(3) {
                    backend.draw_triangle(memory, call, &[triangle[0], triangle[1], triangle[2]], culling);
                }
            }
            4 => backend.draw_triangle_strip(memory, call, &vertices),
            5 => backend.draw_triangle_fan(memory, call, &vertices),
            6 => {
                for corners in vertices.chunks_exact(2) {
                    backend.draw_rectangle(memory, call, &[corners[0], corners[1]]);
                }
            }
            0..=2 => {
                if self.warned.insert(cmd::PRIM) {
                    warn!("points and lines are not rasterized");
                }
            }
            _ => error!("unknown primitive type {kind}"),
        }
    }
}
