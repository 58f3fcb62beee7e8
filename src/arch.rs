use crate::err::PatchError;

mod aarch64;
mod x86;


/// Longest instruction the entry scanner may have to read past the payload.
pub(crate) const MAX_INST_LEN: usize = 15;

/// Instruction sets a jump payload can be generated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    /// 32-bit x86. `mov eax, imm32; jmp eax`
    X86,
    /// x86_64. `mov r11, imm64; jmp r11`
    X64,
    /// aarch64. `ldr x16, #8; br x16; .quad imm64`
    Aarch64,
}

impl Arch {
    /// The instruction set of the current process, if supported.
    pub const fn host() -> Option<Arch> {
        if cfg!(target_arch = "x86_64") {
            Some(Arch::X64)
        } else if cfg!(target_arch = "x86") {
            Some(Arch::X86)
        } else if cfg!(target_arch = "aarch64") {
            Some(Arch::Aarch64)
        } else {
            None
        }
    }

    /// Length of the jump payload. Constant for an architecture.
    pub const fn jump_len(self) -> usize {
        match self {
            Arch::X86 => x86::JMP_EAX_LEN,
            Arch::X64 => x86::JMP_R11_LEN,
            Arch::Aarch64 => aarch64::LDR_BR_LEN,
        }
    }

    /// Required alignment of a function entry.
    pub const fn code_alignment(self) -> usize {
        match self {
            Arch::X86 | Arch::X64 => 1,
            Arch::Aarch64 => 4,
        }
    }

    /// Generates the bytes that unconditionally transfer control to `dest`.
    ///
    /// No register is preserved and the sequence never falls through, so it may only be
    /// placed at the entry of a function.
    pub fn generate_jump(self, dest: usize) -> Vec<u8> {
        match self {
            Arch::X86 => x86::jmp_eax(dest as u32).to_vec(),
            Arch::X64 => x86::jmp_r11(dest as u64).to_vec(),
            Arch::Aarch64 => aarch64::ldr_br(dest as u64).to_vec(),
        }
    }

    /// Counts how many bytes from the start of `code` can be overwritten, stopping as soon as
    /// `required` bytes are covered or control flow leaves the function. Fill bytes after the
    /// last instruction count up to the 16-byte boundary where the next function may start.
    ///
    /// `code` should hold `required + MAX_INST_LEN - 1` bytes, or run up to the end of a page.
    pub(crate) fn patchable_len(self, code: &[u8], ip: u64, required: usize) -> usize {
        match self {
            Arch::X86 => x86::patchable_len(32, code, ip, required),
            Arch::X64 => x86::patchable_len(64, code, ip, required),
            Arch::Aarch64 => aarch64::patchable_len(code, ip, required),
        }
    }
}

/// Returns the host architecture or `UnsupportedArchitecture`.
pub fn host_arch() -> Result<Arch, PatchError> {
    Arch::host().ok_or(PatchError::UnsupportedArchitecture(std::env::consts::ARCH))
}

/// Generates the jump payload to `dest` for the host architecture.
pub fn generate_jump(dest: usize) -> Result<Vec<u8>, PatchError> {
    host_arch().map(|arch| arch.generate_jump(dest))
}
