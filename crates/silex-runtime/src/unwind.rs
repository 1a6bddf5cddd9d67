//! Windows-x64-style unwind
//!
//! Every compiled method (and every funclet) describes its prologue with
//! unwind codes in reverse execution order: stack allocation, pushed
//! non-volatile registers, frame-register establishment. Given an
//! instruction pointer and a machine context, [`virtual_unwind`] replays
//! the codes to produce the caller's context. Both the GC's stack walk
//! and exception propagation run on this one implementation, so they
//! agree to the byte on frame boundaries.

/// Machine context carried through unwinding: the instruction pointer,
/// both stack registers and the non-volatile integer registers. Field
/// order is part of the contract with emitted context-capture thunks.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Context {
    pub rip: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

/// Byte offsets of [`Context`] fields, used by emitted thunks.
pub mod ctx_off {
    pub const RIP: i32 = 0;
    pub const RSP: i32 = 8;
    pub const RBP: i32 = 16;
    pub const RBX: i32 = 24;
    pub const RSI: i32 = 32;
    pub const RDI: i32 = 40;
    pub const R12: i32 = 48;
    pub const R13: i32 = 56;
    pub const R14: i32 = 64;
    pub const R15: i32 = 72;
    pub const SIZE: usize = 80;
}

impl Context {
    /// Read a register by hardware encoding (only the non-volatile set).
    pub fn reg(&self, encoding: u8) -> u64 {
        match encoding {
            3 => self.rbx,
            5 => self.rbp,
            6 => self.rsi,
            7 => self.rdi,
            12 => self.r12,
            13 => self.r13,
            14 => self.r14,
            15 => self.r15,
            _ => panic!("register {encoding} is not tracked by unwind"),
        }
    }

    pub fn set_reg(&mut self, encoding: u8, value: u64) {
        match encoding {
            3 => self.rbx = value,
            5 => self.rbp = value,
            6 => self.rsi = value,
            7 => self.rdi = value,
            12 => self.r12 = value,
            13 => self.r13 = value,
            14 => self.r14 = value,
            15 => self.r15 = value,
            _ => panic!("register {encoding} is not tracked by unwind"),
        }
    }
}

/// One unwind operation, annotated with the prologue offset at which its
/// instruction has completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindCode {
    /// `push reg` of a non-volatile register.
    PushNonvol { prologue_offset: u8, reg: u8 },
    /// `sub rsp, size`.
    Alloc { prologue_offset: u8, size: u32 },
    /// `mov/lea frame_reg, [rsp + 16*sp_offset]`.
    SetFpReg { prologue_offset: u8, sp_offset: u8 },
}

impl UnwindCode {
    fn prologue_offset(&self) -> u8 {
        match *self {
            UnwindCode::PushNonvol {
                prologue_offset, ..
            }
            | UnwindCode::Alloc {
                prologue_offset, ..
            }
            | UnwindCode::SetFpReg {
                prologue_offset, ..
            } => prologue_offset,
        }
    }
}

// Packed operation numbers (UNWIND_CODE.UnwindOp).
const UWOP_PUSH_NONVOL: u8 = 0;
const UWOP_ALLOC_LARGE: u8 = 1;
const UWOP_ALLOC_SMALL: u8 = 2;
const UWOP_SET_FPREG: u8 = 3;

/// Unwind description of one function or funclet.
///
/// `codes` are in reverse prologue order (last executed first), the order
/// in which they are replayed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnwindInfo {
    pub prologue_len: u8,
    /// Frame register hardware encoding and scaled offset, when set.
    pub frame_reg: Option<(u8, u8)>,
    pub codes: Vec<UnwindCode>,
}

impl UnwindInfo {
    /// Serialise into the packed `UNWIND_INFO` layout: version/flags byte,
    /// prologue size, code count, frame byte, then 16-bit code slots.
    pub fn serialize(&self) -> Vec<u8> {
        let mut slots: Vec<u16> = Vec::new();
        for code in &self.codes {
            match *code {
                UnwindCode::PushNonvol {
                    prologue_offset,
                    reg,
                } => {
                    slots.push(u16::from_le_bytes([
                        prologue_offset,
                        (reg << 4) | UWOP_PUSH_NONVOL,
                    ]));
                }
                UnwindCode::Alloc {
                    prologue_offset,
                    size,
                } => {
                    debug_assert!(size >= 8 && size % 8 == 0);
                    if size <= 128 {
                        let scaled = ((size - 8) / 8) as u8;
                        slots.push(u16::from_le_bytes([
                            prologue_offset,
                            (scaled << 4) | UWOP_ALLOC_SMALL,
                        ]));
                    } else if size < 512 * 1024 {
                        slots.push(u16::from_le_bytes([prologue_offset, UWOP_ALLOC_LARGE]));
                        slots.push((size / 8) as u16);
                    } else {
                        slots.push(u16::from_le_bytes([
                            prologue_offset,
                            (1 << 4) | UWOP_ALLOC_LARGE,
                        ]));
                        slots.push(size as u16);
                        slots.push((size >> 16) as u16);
                    }
                }
                UnwindCode::SetFpReg { prologue_offset, .. } => {
                    slots.push(u16::from_le_bytes([prologue_offset, UWOP_SET_FPREG]));
                }
            }
        }

        let mut out = Vec::with_capacity(4 + slots.len() * 2);
        out.push(1); // version 1, no flags
        out.push(self.prologue_len);
        out.push(slots.len() as u8);
        match self.frame_reg {
            Some((reg, offset)) => out.push((offset << 4) | reg),
            None => out.push(0),
        }
        for slot in &slots {
            out.extend_from_slice(&slot.to_le_bytes());
        }
        out
    }

    /// Decode the packed layout back into operations.
    pub fn deserialize(bytes: &[u8]) -> Option<UnwindInfo> {
        if bytes.len() < 4 || bytes[0] & 0x7 != 1 {
            return None;
        }
        let prologue_len = bytes[1];
        let count = bytes[2] as usize;
        let frame_byte = bytes[3];
        let frame_reg = if frame_byte == 0 {
            None
        } else {
            Some((frame_byte & 0xF, frame_byte >> 4))
        };

        let mut slots = Vec::with_capacity(count);
        for i in 0..count {
            let lo = *bytes.get(4 + i * 2)?;
            let hi = *bytes.get(5 + i * 2)?;
            slots.push((lo, hi));
        }

        let mut codes = Vec::new();
        let mut i = 0;
        while i < slots.len() {
            let (prologue_offset, op_byte) = slots[i];
            let op = op_byte & 0xF;
            let info = op_byte >> 4;
            i += 1;
            match op {
                UWOP_PUSH_NONVOL => codes.push(UnwindCode::PushNonvol {
                    prologue_offset,
                    reg: info,
                }),
                UWOP_ALLOC_SMALL => codes.push(UnwindCode::Alloc {
                    prologue_offset,
                    size: info as u32 * 8 + 8,
                }),
                UWOP_ALLOC_LARGE => {
                    let size = if info == 0 {
                        let (lo, hi) = slots[i];
                        i += 1;
                        (u16::from_le_bytes([lo, hi]) as u32) * 8
                    } else {
                        let (lo0, hi0) = slots[i];
                        let (lo1, hi1) = slots[i + 1];
                        i += 2;
                        u16::from_le_bytes([lo0, hi0]) as u32
                            | ((u16::from_le_bytes([lo1, hi1]) as u32) << 16)
                    };
                    codes.push(UnwindCode::Alloc {
                        prologue_offset,
                        size,
                    });
                }
                UWOP_SET_FPREG => codes.push(UnwindCode::SetFpReg {
                    prologue_offset,
                    sp_offset: frame_reg.map(|(_, o)| o).unwrap_or(0),
                }),
                _ => return None,
            }
        }
        Some(UnwindInfo {
            prologue_len,
            frame_reg,
            codes,
        })
    }
}

impl UnwindInfo {
    /// The canonical Tier-0 frame shape: push rbp; mov rbp, rsp; push
    /// rbx, rdi, rsi, r12..r15; sub rsp, `frame_size`. Shared by compiled
    /// methods and the runtime's emitted entry/funclet thunks, which use
    /// byte-identical prologues.
    pub fn tier0_frame(frame_size: u32) -> UnwindInfo {
        UnwindInfo {
            prologue_len: 22,
            frame_reg: Some((5, 0)),
            codes: vec![
                UnwindCode::Alloc {
                    prologue_offset: 22,
                    size: frame_size,
                },
                UnwindCode::PushNonvol {
                    prologue_offset: 15,
                    reg: 15,
                },
                UnwindCode::PushNonvol {
                    prologue_offset: 13,
                    reg: 14,
                },
                UnwindCode::PushNonvol {
                    prologue_offset: 11,
                    reg: 13,
                },
                UnwindCode::PushNonvol {
                    prologue_offset: 9,
                    reg: 12,
                },
                UnwindCode::PushNonvol {
                    prologue_offset: 7,
                    reg: 6,
                },
                UnwindCode::PushNonvol {
                    prologue_offset: 6,
                    reg: 7,
                },
                UnwindCode::PushNonvol {
                    prologue_offset: 5,
                    reg: 3,
                },
                UnwindCode::SetFpReg {
                    prologue_offset: 4,
                    sp_offset: 0,
                },
                UnwindCode::PushNonvol {
                    prologue_offset: 1,
                    reg: 5,
                },
            ],
        }
    }

    /// The funclet frame shape: push rbp; push rbx, rdi, rsi, r12..r15;
    /// mov rbp, rdx (the parent frame pointer); sub rsp, size. No frame
    /// register is recorded - rbp holds the *parent's* frame, so replay
    /// must run off rsp, which funclets never move.
    pub fn funclet_frame(frame_size: u32) -> UnwindInfo {
        UnwindInfo {
            prologue_len: 22,
            frame_reg: None,
            codes: vec![
                UnwindCode::Alloc {
                    prologue_offset: 22,
                    size: frame_size,
                },
                UnwindCode::PushNonvol {
                    prologue_offset: 12,
                    reg: 15,
                },
                UnwindCode::PushNonvol {
                    prologue_offset: 10,
                    reg: 14,
                },
                UnwindCode::PushNonvol {
                    prologue_offset: 8,
                    reg: 13,
                },
                UnwindCode::PushNonvol {
                    prologue_offset: 6,
                    reg: 12,
                },
                UnwindCode::PushNonvol {
                    prologue_offset: 4,
                    reg: 6,
                },
                UnwindCode::PushNonvol {
                    prologue_offset: 3,
                    reg: 7,
                },
                UnwindCode::PushNonvol {
                    prologue_offset: 2,
                    reg: 3,
                },
                UnwindCode::PushNonvol {
                    prologue_offset: 1,
                    reg: 5,
                },
            ],
        }
    }

    /// The trampoline frame shape: push rbp; mov rbp, rsp; sub rsp, size.
    pub fn trampoline_frame(frame_size: u32) -> UnwindInfo {
        UnwindInfo {
            prologue_len: 8,
            frame_reg: Some((5, 0)),
            codes: vec![
                UnwindCode::Alloc {
                    prologue_offset: 8,
                    size: frame_size,
                },
                UnwindCode::SetFpReg {
                    prologue_offset: 4,
                    sp_offset: 0,
                },
                UnwindCode::PushNonvol {
                    prologue_offset: 1,
                    reg: 5,
                },
            ],
        }
    }
}

/// Replay unwind codes to produce the caller's context.
///
/// `ip_offset` is the instruction pointer's offset from the function
/// start; codes describing prologue instructions that have not executed
/// yet are skipped.
///
/// # Safety
/// The context must describe a live frame of the function the info was
/// built for; the replay dereferences stack memory.
pub unsafe fn virtual_unwind(info: &UnwindInfo, ip_offset: u32, ctx: &Context) -> Context {
    let mut out = *ctx;
    let mut sp = ctx.rsp;
    for code in &info.codes {
        if (code.prologue_offset() as u32) > ip_offset {
            continue;
        }
        match *code {
            UnwindCode::Alloc { size, .. } => sp += size as u64,
            UnwindCode::PushNonvol { reg, .. } => {
                out.set_reg(reg, *(sp as *const u64));
                sp += 8;
            }
            UnwindCode::SetFpReg { sp_offset, .. } => {
                let (reg, _) = info.frame_reg.expect("set_fpreg without frame register");
                // The frame register still holds the callee's value at
                // this point of the replay: pops only rewrite `out`.
                let base = if reg == 5 { ctx.rbp } else { ctx.reg(reg) };
                sp = base - 16 * sp_offset as u64;
            }
        }
    }
    out.rip = *(sp as *const u64);
    out.rsp = sp + 8;
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The canonical Tier-0 prologue: push rbp; mov rbp, rsp; push rbx,
    /// rdi, rsi, r12..r15; sub rsp, N.
    fn tier0_info(frame_size: u32) -> UnwindInfo {
        UnwindInfo {
            prologue_len: 22,
            frame_reg: Some((5, 0)),
            codes: vec![
                UnwindCode::Alloc {
                    prologue_offset: 22,
                    size: frame_size,
                },
                UnwindCode::PushNonvol {
                    prologue_offset: 15,
                    reg: 15,
                },
                UnwindCode::PushNonvol {
                    prologue_offset: 13,
                    reg: 14,
                },
                UnwindCode::PushNonvol {
                    prologue_offset: 11,
                    reg: 13,
                },
                UnwindCode::PushNonvol {
                    prologue_offset: 9,
                    reg: 12,
                },
                UnwindCode::PushNonvol {
                    prologue_offset: 7,
                    reg: 6,
                },
                UnwindCode::PushNonvol {
                    prologue_offset: 6,
                    reg: 7,
                },
                UnwindCode::PushNonvol {
                    prologue_offset: 5,
                    reg: 3,
                },
                UnwindCode::SetFpReg {
                    prologue_offset: 4,
                    sp_offset: 0,
                },
                UnwindCode::PushNonvol {
                    prologue_offset: 1,
                    reg: 5,
                },
            ],
        }
    }

    #[test]
    fn test_serialize_round_trip() {
        let info = tier0_info(0x88);
        let bytes = info.serialize();
        let back = UnwindInfo::deserialize(&bytes).unwrap();
        assert_eq!(back, info);
    }

    #[test]
    fn test_serialize_large_alloc() {
        let info = UnwindInfo {
            prologue_len: 8,
            frame_reg: None,
            codes: vec![UnwindCode::Alloc {
                prologue_offset: 8,
                size: 0x1000,
            }],
        };
        let back = UnwindInfo::deserialize(&info.serialize()).unwrap();
        assert_eq!(back, info);

        let huge = UnwindInfo {
            prologue_len: 8,
            frame_reg: None,
            codes: vec![UnwindCode::Alloc {
                prologue_offset: 8,
                size: 0x10_0000,
            }],
        };
        let back = UnwindInfo::deserialize(&huge.serialize()).unwrap();
        assert_eq!(back, huge);
    }

    #[test]
    fn test_virtual_unwind_full_frame() {
        // Build a fake stack image of a completed Tier-0 prologue.
        let frame_size = 0x48u64;
        let mut stack = vec![0u64; 64];
        let top = stack.as_mut_ptr() as u64 + 63 * 8;

        // Caller pushes return address; prologue pushes rbp and the six
        // other non-volatile registers, then allocates.
        let ret_addr = 0x1122_3344u64;
        let caller_rbp = 0xAAAA_0001u64;
        let saved = [
            (5u8, caller_rbp),
            (3, 0xB_0003),
            (7, 0xB_0007),
            (6, 0xB_0006),
            (12, 0xB_0012),
            (13, 0xB_0013),
            (14, 0xB_0014),
            (15, 0xB_0015),
        ];
        unsafe {
            *(top as *mut u64) = ret_addr;
            for (i, (_, value)) in saved.iter().enumerate() {
                *((top - 8 * (i as u64 + 1)) as *mut u64) = *value;
            }
        }
        let rbp = top - 8; // established right after push rbp
        let rsp = rbp - 7 * 8 - frame_size;

        let ctx = Context {
            rip: 0x40, // mid-body
            rsp,
            rbp,
            ..Default::default()
        };
        let info = tier0_info(frame_size as u32);
        let caller = unsafe { virtual_unwind(&info, 0x40, &ctx) };

        assert_eq!(caller.rip, ret_addr);
        assert_eq!(caller.rsp, top + 8);
        assert_eq!(caller.rbp, caller_rbp);
        assert_eq!(caller.rbx, 0xB_0003);
        assert_eq!(caller.rdi, 0xB_0007);
        assert_eq!(caller.rsi, 0xB_0006);
        assert_eq!(caller.r12, 0xB_0012);
        assert_eq!(caller.r15, 0xB_0015);
    }

    #[test]
    fn test_virtual_unwind_mid_prologue() {
        // Only `push rbp` has executed (offset 1): the replay must skip
        // everything else.
        let mut stack = vec![0u64; 8];
        let top = stack.as_mut_ptr() as u64 + 7 * 8;
        let ret_addr = 0x5566u64;
        let caller_rbp = 0x7788u64;
        unsafe {
            *(top as *mut u64) = ret_addr;
            *((top - 8) as *mut u64) = caller_rbp;
        }
        let ctx = Context {
            rip: 1,
            rsp: top - 8,
            rbp: 0xFFFF, // not yet established
            ..Default::default()
        };
        let caller = unsafe { virtual_unwind(&tier0_info(0x28), 1, &ctx) };
        assert_eq!(caller.rip, ret_addr);
        assert_eq!(caller.rsp, top + 8);
        assert_eq!(caller.rbp, caller_rbp);
    }
}
