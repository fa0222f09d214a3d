use crate::remote_ptr::{RemotePtr, Void};
use std::{
    convert::TryInto,
    fmt,
    io::{self, Write},
};

macro_rules! user_regs {
    ($($reg:ident),+ $(,)?) => {
        /// Mirror of the x86-64 kernel `user_regs_struct`, in kernel field order.
        #[repr(C)]
        #[derive(Copy, Clone, Default, Eq, PartialEq, Debug)]
        pub struct UserRegs {
            $(pub $reg: u64,)+
        }

        const REGISTER_NAMES: &[&str] = &[$(stringify!($reg),)+];

        impl UserRegs {
            fn to_words(&self) -> [u64; NUM_USER_REGS] {
                [$(self.$reg,)+]
            }

            fn from_words(words: &[u64; NUM_USER_REGS]) -> UserRegs {
                let mut it = words.iter();
                UserRegs {
                    $($reg: *it.next().unwrap_or(&0),)+
                }
            }
        }
    };
}

pub const NUM_USER_REGS: usize = 27;

user_regs!(
    r15, r14, r13, r12, rbp, rbx, r11, r10, r9, r8, rax, rcx, rdx, rsi, rdi, orig_rax, rip, cs,
    eflags, rsp, ss, fs_base, gs_base, ds, es, fs, gs,
);

assert_eq_size!(UserRegs, [u64; NUM_USER_REGS]);

/// Size of a register snapshot on disk.
pub const REGISTERS_ENCODED_SIZE: usize = NUM_USER_REGS * 8;

/// General purpose register snapshot captured at an event boundary.
#[derive(Copy, Clone, Default, Eq, PartialEq, Debug)]
pub struct Registers {
    u: UserRegs,
}

impl Registers {
    pub fn new(u: UserRegs) -> Registers {
        Registers { u }
    }

    pub fn user_regs(&self) -> &UserRegs {
        &self.u
    }

    pub fn user_regs_mut(&mut self) -> &mut UserRegs {
        &mut self.u
    }

    pub fn ip(&self) -> RemotePtr<Void> {
        RemotePtr::from(self.u.rip)
    }
    pub fn set_ip(&mut self, addr: RemotePtr<Void>) {
        self.u.rip = addr.as_usize() as u64;
    }

    pub fn sp(&self) -> RemotePtr<Void> {
        RemotePtr::from(self.u.rsp)
    }
    pub fn set_sp(&mut self, addr: RemotePtr<Void>) {
        self.u.rsp = addr.as_usize() as u64;
    }

    pub fn original_syscallno(&self) -> isize {
        self.u.orig_rax as isize
    }

    pub fn syscall_result(&self) -> usize {
        self.u.rax as usize
    }

    pub fn flags(&self) -> usize {
        self.u.eflags as usize
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        for w in self.u.to_words().iter() {
            out.extend_from_slice(&w.to_le_bytes());
        }
    }

    /// `data` must be exactly `REGISTERS_ENCODED_SIZE` bytes.
    pub fn decode(data: &[u8]) -> io::Result<Registers> {
        if data.len() != REGISTERS_ENCODED_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "register block is {} bytes, expected {}",
                    data.len(),
                    REGISTERS_ENCODED_SIZE
                ),
            ));
        }
        let mut words = [0u64; NUM_USER_REGS];
        for (w, chunk) in words.iter_mut().zip(data.chunks_exact(8)) {
            // chunks_exact(8) guarantees the conversion.
            *w = u64::from_le_bytes(chunk.try_into().unwrap());
        }
        Ok(Registers {
            u: UserRegs::from_words(&words),
        })
    }

    /// Write `name:value` pairs for every register on one line.
    pub fn write_register_file_compact(&self, f: &mut dyn Write) -> io::Result<()> {
        let words = self.u.to_words();
        for (i, (name, val)) in REGISTER_NAMES.iter().zip(words.iter()).enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}:{:#x}", name, val)?;
        }
        Ok(())
    }

    /// Space separated decimal values, in kernel order.
    pub fn write_register_file_for_trace_raw(&self, f: &mut dyn Write) -> io::Result<()> {
        for val in self.u.to_words().iter() {
            write!(f, " {}", val)?;
        }
        Ok(())
    }
}

impl fmt::Display for Registers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ ip:{} sp:{} }}", self.ip(), self.sp())
    }
}
