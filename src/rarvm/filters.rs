//! Compiling RAR v3 filter bytecode and running the resulting filter queue
//! against the LZSS window.
//!
//! Grounded on `ext/unarr/rar/filter-rar.c`: `rar_compile_program`,
//! `rar_parse_filter`, `rar_run_filters`, and the four fingerprinted native
//! fast paths (`rar_execute_filter_{delta,e8,rgb,audio}`).
//!
//! Programs and filter-stack entries are owned by a single [`FilterQueue`]
//! arena and referenced by index rather than via the reference's intrusive
//! linked lists — there's no cycle here, just a flat append-only program
//! list and a FIFO filter stack, so a `Vec`/`VecDeque` plus indices is a
//! direct and simpler fit than reference-counted nodes.

use std::collections::VecDeque;

use crate::bitreader::BitReader;
use crate::error::{Error, FormatError};
use crate::lzss::Lzss;
use crate::stream::MemoryStream;

use super::audio::VmAudioState;
use super::opcodes::{self, AddressingMode, Instruction};
use super::program::{
    CompiledOpcode, Program, VirtualMachine, DEFAULT_INSTRUCTION_BUDGET, SYSTEM_GLOBAL_ADDRESS,
    SYSTEM_GLOBAL_SIZE, USER_GLOBAL_SIZE,
};

const DELTA_FINGERPRINT: u64 = 0x1D0E06077D;
const E8_FINGERPRINT: u64 = 0x35AD576887;
const E8E9_FINGERPRINT: u64 = 0x393CD7E57E;
const RGB_FINGERPRINT: u64 = 0x951C2C5DC8;
const AUDIO_FINGERPRINT: u64 = 0xD8BC85E701;

/// A compiled filter program plus the side data compilation attaches to it.
struct ProgramCode {
    program: Program,
    staticdata: Vec<u8>,
    fingerprint: u64,
    usage_count: u32,
    old_filter_length: u32,
    global_backup: Vec<u8>,
}

/// One pending filter invocation, referencing its compiled program by index
/// into [`FilterQueue::programs`].
struct Filter {
    prog_index: usize,
    initial_registers: [u32; 8],
    global_data: Vec<u8>,
    block_start_pos: u64,
    block_length: u32,
    filtered_block_address: u32,
    filtered_block_length: u32,
}

/// Output of [`FilterQueue::run_filters`]: a view into the VM's memory
/// holding the filtered bytes ready for delivery.
pub struct FilteredBytes {
    pub address: u32,
    pub length: u32,
}

/// The per-entry filter program cache and pending-filter stack.
#[derive(Default)]
pub struct FilterQueue {
    programs: Vec<ProgramCode>,
    stack: VecDeque<Filter>,
    vm: Option<VirtualMachine>,
    last_filter_num: u32,
    filter_start: Option<u64>,
    instruction_budget: u64,
}

impl FilterQueue {
    pub fn new(instruction_budget: u64) -> Self {
        Self {
            instruction_budget,
            ..Default::default()
        }
    }

    /// True if there's a pending filter block starting at or before `pos`.
    pub fn filter_start(&self) -> Option<u64> {
        self.filter_start
    }

    /// The absolute `Lzss` position one past the end of the front pending
    /// filter's source block, if any. The caller must decode ordinary
    /// symbols through this position (writing the filter's source bytes
    /// into the window via the normal literal/match path) before
    /// [`Self::run_filters`] can read them back out and apply the filter.
    pub fn pending_filter_end(&self) -> Option<u64> {
        self.stack
            .front()
            .map(|f| f.block_start_pos + f.block_length as u64)
    }

    fn parse_operand(
        br: &mut BitReader,
        instruction: Instruction,
        bytemode: bool,
        instrcount: Option<u32>,
    ) -> Result<(u8, u32), FormatError> {
        let (mode, mut value);
        if br.bit() {
            mode = AddressingMode::Register(br.bits(3) as u8);
            value = 0;
            return Ok((encode_mode(mode), value));
        }
        if br.bit() {
            if br.bit() {
                if br.bit() {
                    mode = AddressingMode::Absolute(0);
                } else {
                    mode = AddressingMode::IndexedAbsolute(br.bits(3) as u8, 0);
                }
                value = br.read_rarvm_number();
                mode = match mode {
                    AddressingMode::Absolute(_) => AddressingMode::Absolute(value),
                    AddressingMode::IndexedAbsolute(r, _) => AddressingMode::IndexedAbsolute(r, value),
                    m => m,
                };
            } else {
                mode = AddressingMode::RegisterIndirect(br.bits(3) as u8);
                value = 0;
            }
            return Ok((encode_mode(mode), value));
        }
        mode = AddressingMode::Immediate(0);
        value = if !bytemode {
            br.read_rarvm_number()
        } else {
            br.bits(8)
        };
        if let Some(instrcount) = instrcount {
            if opcodes::is_relative_jump(instruction) {
                if value >= 256 {
                    value -= 256;
                } else {
                    if value >= 136 {
                        value = value.wrapping_sub(264);
                    } else if value >= 16 {
                        value = value.wrapping_sub(8);
                    } else if value >= 8 {
                        value = value.wrapping_sub(16);
                    }
                    value = value.wrapping_add(instrcount);
                }
            }
        }
        if br.at_eof() {
            return Err(FormatError::BadBitstream("vm program truncated"));
        }
        Ok((encode_mode(mode), value))
    }

    /// Compile a filter bytecode blob: the first byte is an XOR checksum of
    /// the rest, then an optional static-data block, then a stream of
    /// variable-width instructions.
    fn compile_program(bytes: &[u8]) -> Result<ProgramCode, FormatError> {
        if bytes.is_empty() {
            return Err(FormatError::BadBitstream("empty vm program"));
        }
        let checksum = bytes[1..].iter().fold(0u8, |acc, b| acc ^ b);
        if checksum != bytes[0] {
            return Err(FormatError::BadBitstream("vm program checksum mismatch"));
        }

        let fingerprint = crc32fast::hash(bytes) as u64 | ((bytes.len() as u64) << 32);

        let mut mem = MemoryStream::new(&bytes[1..]);
        let mut br = BitReader::new(&mut mem, (bytes.len() - 1) as u64);

        let mut staticdata = Vec::new();
        if br.bit() {
            let len = br.read_rarvm_number() as usize + 1;
            staticdata.reserve(len);
            for _ in 0..len {
                staticdata.push(br.bits(8) as u8);
            }
        }

        let mut program = Program::default();
        let mut instrcount = 0u32;
        while !br.at_eof() && br.ensure(8) {
            let mut instr_byte = br.bits(4) as u8;
            if instr_byte & 0x08 != 0 {
                instr_byte = ((instr_byte << 2) | br.bits(2) as u8).wrapping_sub(24);
            }
            let instruction = Instruction::try_from(instr_byte)
                .map_err(|_| FormatError::BadBitstream("unknown vm instruction"))?;
            let bytemode = if opcodes::has_byte_mode(instruction) {
                br.bit()
            } else {
                false
            };
            let numargs = opcodes::operand_count(instruction);

            let (am1, v1) = if numargs >= 1 {
                Self::parse_operand(&mut br, instruction, bytemode, Some(instrcount))?
            } else {
                (0, 0)
            };
            let (am2, v2) = if numargs == 2 {
                Self::parse_operand(&mut br, instruction, bytemode, None)?
            } else {
                (0, 0)
            };

            let raw_bytemode = match instruction {
                Instruction::Movzx | Instruction::Movsx => 2,
                _ if bytemode => 1 | 2,
                _ => 0,
            };
            program.opcodes.push(CompiledOpcode {
                instruction,
                bytemode: raw_bytemode,
                addressingmode1: am1,
                value1: v1,
                addressingmode2: am2,
                value2: v2,
            });
            instrcount += 1;
        }

        if !program.is_terminated() {
            program.opcodes.push(CompiledOpcode {
                instruction: Instruction::Ret,
                bytemode: 0,
                addressingmode1: 0,
                value1: 0,
                addressingmode2: 0,
                value2: 0,
            });
        }

        Ok(ProgramCode {
            program,
            staticdata,
            fingerprint,
            usage_count: 0,
            old_filter_length: 0,
            global_backup: Vec::new(),
        })
    }

    /// Parse a `0x28` (RAR5-era) / RAR v3 `parse filter` service block,
    /// pushing a new [`Filter`] onto the stack.
    #[allow(clippy::too_many_arguments)]
    pub fn parse_filter(
        &mut self,
        bytes: &[u8],
        flags: u8,
        lzss_position: u64,
    ) -> Result<(), Error> {
        let mut mem = MemoryStream::new(bytes);
        let mut br = BitReader::new(&mut mem, bytes.len() as u64);

        let num_progs = self.programs.len() as u32;
        let num = if flags & 0x80 != 0 {
            let raw = br.read_rarvm_number();
            let n = if raw == 0 {
                self.stack.clear();
                self.programs.clear();
                0
            } else {
                raw - 1
            };
            if n > num_progs {
                return Err(FormatError::BadBitstream("invalid rar vm program number").into());
            }
            self.last_filter_num = n;
            n
        } else {
            self.last_filter_num
        };

        let have_existing = (num as usize) < self.programs.len();
        if have_existing {
            self.programs[num as usize].usage_count += 1;
        }

        let mut block_start_pos = br.read_rarvm_number() as u64 + lzss_position;
        if flags & 0x40 != 0 {
            block_start_pos += 258;
        }
        let mut block_length = if flags & 0x20 != 0 {
            br.read_rarvm_number()
        } else if have_existing {
            self.programs[num as usize].old_filter_length
        } else {
            0
        };

        let mut registers = [0u32; 8];
        registers[3] = SYSTEM_GLOBAL_ADDRESS;
        registers[4] = block_length;
        registers[5] = if have_existing {
            self.programs[num as usize].usage_count
        } else {
            0
        };
        registers[7] = super::program::MEMORY_SIZE as u32;

        if flags & 0x10 != 0 {
            let mask = br.bits(7) as u8;
            for (i, reg) in registers.iter_mut().enumerate().take(7) {
                if mask & (1 << i) != 0 {
                    *reg = br.read_rarvm_number();
                }
            }
        }

        let prog_index = if have_existing {
            num as usize
        } else {
            let len = br.read_rarvm_number() as usize;
            if len == 0 || len > 0x10000 {
                return Err(FormatError::BadBitstream("invalid rar vm bytecode length").into());
            }
            let mut bytecode = Vec::with_capacity(len);
            for _ in 0..len {
                bytecode.push(br.bits(8) as u8);
            }
            let code = Self::compile_program(&bytecode)?;
            self.programs.push(code);
            self.programs.len() - 1
        };
        self.programs[prog_index].old_filter_length = block_length;
        block_length = self.programs[prog_index].old_filter_length;

        let mut global_data = vec![0u8; SYSTEM_GLOBAL_SIZE as usize];
        if flags & 0x08 != 0 {
            let globaldatalen = br.read_rarvm_number();
            if globaldatalen > USER_GLOBAL_SIZE {
                return Err(FormatError::BadBitstream("invalid rar vm global data length").into());
            }
            global_data.resize(SYSTEM_GLOBAL_SIZE as usize + globaldatalen as usize, 0);
            for i in 0..globaldatalen as usize {
                global_data[SYSTEM_GLOBAL_SIZE as usize + i] = br.bits(8) as u8;
            }
        }

        if br.at_eof() {
            return Err(FormatError::BadBitstream("rar vm filter block truncated").into());
        }

        for (i, reg) in registers.iter().enumerate().take(7) {
            global_data[i * 4..i * 4 + 4].copy_from_slice(&reg.to_le_bytes());
        }
        global_data[0x1C..0x20].copy_from_slice(&block_length.to_le_bytes());
        global_data[0x20..0x24].copy_from_slice(&0u32.to_le_bytes());
        let usage = self.programs[prog_index].usage_count;
        global_data[0x2C..0x30].copy_from_slice(&usage.to_le_bytes());

        let is_first = self.stack.is_empty();
        self.stack.push_back(Filter {
            prog_index,
            initial_registers: registers,
            global_data,
            block_start_pos,
            block_length,
            filtered_block_address: 0,
            filtered_block_length: 0,
        });
        if is_first {
            self.filter_start = Some(block_start_pos);
        }

        Ok(())
    }

    fn execute_filter(&mut self, filter_idx: usize, pos: u64) -> Result<(), Error> {
        let vm = self.vm.get_or_insert_with(VirtualMachine::new);
        let budget = self.instruction_budget;
        let prog_index = self.stack[filter_idx].prog_index;
        let fingerprint = self.programs[prog_index].fingerprint;

        match fingerprint {
            DELTA_FINGERPRINT => execute_delta(&mut self.stack[filter_idx], vm),
            E8_FINGERPRINT => execute_e8(&mut self.stack[filter_idx], vm, pos, false),
            E8E9_FINGERPRINT => execute_e8(&mut self.stack[filter_idx], vm, pos, true),
            RGB_FINGERPRINT => execute_rgb(&mut self.stack[filter_idx], vm),
            AUDIO_FINGERPRINT => execute_audio(&mut self.stack[filter_idx], vm),
            _ => {
                tracing::debug!(fingerprint, "unknown rar vm parsing filter, running bytecode");
                execute_generic(
                    &mut self.stack[filter_idx],
                    &mut self.programs[prog_index],
                    vm,
                    pos,
                    budget,
                )
            }
        }
    }

    /// Run the next filter block. The caller must have already decoded
    /// ordinary symbols through [`Self::pending_filter_end`] (bounding its
    /// `expand` calls by it, the way it bounds them by `filter_start()` to
    /// reach the block's start) so the filter's source bytes are sitting in
    /// the LZSS window; this copies them into VM memory, executes the
    /// filter, and returns the filtered output range. Mirrors
    /// `rar_run_filters`, minus the `rar_expand` catch-up call the reference
    /// makes before executing — calling back into the surrounding
    /// uncompressor's `expand` from here would need a second mutable borrow
    /// of this same `FilterQueue` for any nested filter triggers it decodes,
    /// which a callback parameter can't express cleanly; relying on the
    /// caller's invariant avoids that entirely.
    pub fn run_filters(&mut self, lzss: &Lzss) -> Result<FilteredBytes, Error> {
        let filter = self
            .stack
            .front()
            .ok_or_else(|| Error::from(FormatError::BadBitstream("no pending rar vm filter")))?;
        let start = filter.block_start_pos;
        let block_length = filter.block_length;
        let end = start + block_length as u64;
        self.filter_start = None;

        if lzss.position() < end {
            return Err(FormatError::BadBitstream("filter block not yet decoded").into());
        }

        if self.vm.is_none() {
            self.vm = Some(VirtualMachine::new());
        }
        {
            let vm = self.vm.as_mut().unwrap();
            let mut buf = vec![0u8; block_length as usize];
            lzss.copy_bytes_from(&mut buf, start, block_length as usize);
            vm.memory[..buf.len()].copy_from_slice(&buf);
        }

        self.execute_filter(0, 0)?;

        let mut last_address = self.stack[0].filtered_block_address;
        let mut last_length = self.stack[0].filtered_block_length;
        self.stack.pop_front();

        while let Some(front) = self.stack.front() {
            if front.block_start_pos != end || front.block_length != last_length {
                break;
            }
            {
                let vm = self.vm.as_mut().unwrap();
                vm.memory.copy_within(
                    last_address as usize..last_address as usize + last_length as usize,
                    0,
                );
            }
            self.execute_filter(0, 0)?;
            last_address = self.stack[0].filtered_block_address;
            last_length = self.stack[0].filtered_block_length;
            self.stack.pop_front();
        }

        if let Some(front) = self.stack.front() {
            if front.block_start_pos < end {
                return Err(FormatError::BadBitstream("bad rar vm filter order").into());
            }
            self.filter_start = Some(front.block_start_pos);
        }

        Ok(FilteredBytes {
            address: last_address,
            length: last_length,
        })
    }

    /// Read the filtered bytes out of VM memory after [`Self::run_filters`].
    pub fn filtered_slice(&self, bytes: &FilteredBytes) -> &[u8] {
        let vm = self.vm.as_ref().expect("run_filters populates vm");
        &vm.memory[bytes.address as usize..(bytes.address + bytes.length) as usize]
    }
}

fn encode_mode(mode: AddressingMode) -> u8 {
    match mode {
        AddressingMode::Register(r) => r,
        AddressingMode::RegisterIndirect(r) => 8 + r,
        AddressingMode::IndexedAbsolute(r, _) => 16 + r,
        AddressingMode::Absolute(_) => 24,
        AddressingMode::Immediate(_) => 25,
    }
}

fn execute_delta(filter: &mut Filter, vm: &mut VirtualMachine) -> Result<(), Error> {
    let length = filter.initial_registers[4] as usize;
    let numchannels = filter.initial_registers[0] as usize;
    if length > super::program::WORK_SIZE / 2 {
        return Err(FormatError::BadBitstream("delta filter block too large").into());
    }

    let (src_part, dst_part) = vm.memory.split_at_mut(length);
    for i in 0..numchannels {
        let mut lastbyte = 0u8;
        let mut idx = i;
        let mut src_pos = i;
        while idx < length {
            lastbyte = lastbyte.wrapping_sub(src_part[src_pos]);
            dst_part[idx] = lastbyte;
            idx += numchannels;
            src_pos += 1;
        }
    }

    filter.filtered_block_address = length as u32;
    filter.filtered_block_length = length as u32;
    Ok(())
}

fn execute_e8(
    filter: &mut Filter,
    vm: &mut VirtualMachine,
    pos: u64,
    e9_also: bool,
) -> Result<(), Error> {
    let length = filter.initial_registers[4] as usize;
    let file_size: u32 = 0x0100_0000;
    if length > super::program::WORK_SIZE || length <= 4 {
        return Err(FormatError::BadBitstream("e8 filter block too large").into());
    }

    let mut i = 0usize;
    while i <= length - 5 {
        let b = vm.memory[i];
        if b == 0xE8 || (e9_also && b == 0xE9) {
            let currpos = pos as u32 + i as u32 + 1;
            let address = vm.read32(i as u32 + 1) as i32;
            if address < 0 && currpos >= (-address) as u32 {
                vm.write32(i as u32 + 1, (address as i64 + file_size as i64) as u32);
            } else if address >= 0 && (address as u32) < file_size {
                vm.write32(i as u32 + 1, address.wrapping_sub(currpos as i32) as u32);
            }
            i += 4;
        }
        i += 1;
    }

    filter.filtered_block_address = 0;
    filter.filtered_block_length = length as u32;
    Ok(())
}

fn execute_rgb(filter: &mut Filter, vm: &mut VirtualMachine) -> Result<(), Error> {
    let stride = filter.initial_registers[0] as usize;
    let byteoffset = filter.initial_registers[1] as usize;
    let blocklength = filter.initial_registers[4] as usize;
    if blocklength > super::program::WORK_SIZE / 2 || stride > blocklength {
        return Err(FormatError::BadBitstream("rgb filter block too large").into());
    }

    let (src_part, dst_part) = vm.memory.split_at_mut(blocklength);
    for i in 0..3usize {
        let mut byte = 0u8;
        let mut prev: i64 = i as i64 - stride as i64;
        let mut j = i;
        let mut src_pos = i;
        while j < blocklength {
            if prev >= 0 {
                let p0 = dst_part[prev as usize];
                let p3 = dst_part[(prev + 3) as usize];
                let delta1 = (p3 as i32 - p0 as i32).unsigned_abs();
                let delta2 = (byte as i32 - p0 as i32).unsigned_abs();
                let delta3 = (p3 as i32 - p0 as i32 + byte as i32 - p0 as i32).unsigned_abs();
                if delta1 > delta2 || delta1 > delta3 {
                    byte = if delta2 <= delta3 { p3 } else { p0 };
                }
            }
            byte = byte.wrapping_sub(src_part[src_pos]);
            dst_part[j] = byte;
            prev += 3;
            j += 3;
            src_pos += 1;
        }
    }
    let mut i = byteoffset;
    while i + 2 < blocklength {
        dst_part[i] = dst_part[i].wrapping_add(dst_part[i + 1]);
        dst_part[i + 2] = dst_part[i + 2].wrapping_add(dst_part[i + 1]);
        i += 3;
    }

    filter.filtered_block_address = blocklength as u32;
    filter.filtered_block_length = blocklength as u32;
    Ok(())
}

fn execute_audio(filter: &mut Filter, vm: &mut VirtualMachine) -> Result<(), Error> {
    let length = filter.initial_registers[4] as usize;
    let numchannels = filter.initial_registers[0] as usize;
    if length > super::program::WORK_SIZE / 2 {
        return Err(FormatError::BadBitstream("audio filter block too large").into());
    }

    let (src_part, dst_part) = vm.memory.split_at_mut(length);
    for i in 0..numchannels {
        let mut state = VmAudioState::new();
        let mut j = i;
        let mut src_pos = i;
        while j < length {
            let delta = src_part[src_pos] as i8;
            dst_part[j] = state.decode(delta);
            j += numchannels;
            src_pos += 1;
        }
    }

    filter.filtered_block_address = length as u32;
    filter.filtered_block_length = length as u32;
    Ok(())
}

fn execute_generic(
    filter: &mut Filter,
    prog: &mut ProgramCode,
    vm: &mut VirtualMachine,
    pos: u64,
    budget: u64,
) -> Result<(), Error> {
    let globallen = (filter.global_data.len()).min(SYSTEM_GLOBAL_SIZE as usize);
    vm.memory[SYSTEM_GLOBAL_ADDRESS as usize..SYSTEM_GLOBAL_ADDRESS as usize + globallen]
        .copy_from_slice(&filter.global_data[..globallen]);
    if !prog.staticdata.is_empty() {
        let staticlen = prog
            .staticdata
            .len()
            .min(USER_GLOBAL_SIZE as usize - globallen);
        let base = super::program::USER_GLOBAL_ADDRESS as usize;
        vm.memory[base..base + staticlen].copy_from_slice(&prog.staticdata[..staticlen]);
    }
    vm.registers = filter.initial_registers;

    vm.execute(&prog.program, budget)
        .map_err(crate::error::Error::BadVmProgram)?;

    let newgloballen = vm
        .read32(SYSTEM_GLOBAL_ADDRESS + 0x30)
        .min(USER_GLOBAL_SIZE);
    if newgloballen > 0 {
        let total = SYSTEM_GLOBAL_SIZE + newgloballen;
        filter.global_data = vm.memory[SYSTEM_GLOBAL_ADDRESS as usize
            ..SYSTEM_GLOBAL_ADDRESS as usize + total as usize]
            .to_vec();
    } else {
        filter.global_data.clear();
    }

    filter.filtered_block_address =
        vm.read32(SYSTEM_GLOBAL_ADDRESS + 0x20) & (super::program::MEMORY_SIZE as u32 - 1);
    filter.filtered_block_length =
        vm.read32(SYSTEM_GLOBAL_ADDRESS + 0x1C) & (super::program::MEMORY_SIZE as u32 - 1);
    if filter.filtered_block_address as u64 + filter.filtered_block_length as u64
        >= super::program::MEMORY_SIZE as u64
    {
        filter.filtered_block_address = 0;
        filter.filtered_block_length = 0;
        return Err(FormatError::BadBitstream("filter produced out-of-range block").into());
    }

    if filter.global_data.len() > SYSTEM_GLOBAL_SIZE as usize {
        prog.global_backup = filter.global_data.clone();
    } else {
        prog.global_backup.clear();
    }

    let _ = pos;
    Ok(())
}

/// Default RAR VM instruction budget re-exported for callers that want it
/// without depending on `rarvm::program` directly.
pub const DEFAULT_BUDGET: u64 = DEFAULT_INSTRUCTION_BUDGET;
