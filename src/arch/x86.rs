use iced_x86::{Decoder, DecoderOptions, FlowControl};

pub(super) const JMP_EAX_LEN: usize = 7;
pub(super) const JMP_R11_LEN: usize = 13;

const FUNCTION_ALIGN: u64 = 16;
const INT3: u8 = 0xcc;
const NOP: u8 = 0x90;

pub(super) fn jmp_eax(dest: u32) -> [u8; JMP_EAX_LEN] {
    let mut buf = [0u8; JMP_EAX_LEN];
    // mov eax, dest
    buf[0] = 0xb8;
    buf[1..5].copy_from_slice(&dest.to_le_bytes());
    // jmp eax
    buf[5..].copy_from_slice(&[0xff, 0xe0]);
    buf
}

// r11 is caller-saved and carries no argument in both the SysV and the Win64 ABI.
// rax is avoided since `al` holds the vector register count of variadic calls.
pub(super) fn jmp_r11(dest: u64) -> [u8; JMP_R11_LEN] {
    let mut buf = [0u8; JMP_R11_LEN];
    // mov r11, dest
    buf[..2].copy_from_slice(&[0x49, 0xbb]);
    buf[2..10].copy_from_slice(&dest.to_le_bytes());
    // jmp r11
    buf[10..].copy_from_slice(&[0x41, 0xff, 0xe3]);
    buf
}

pub(super) fn patchable_len(bitness: u32, code: &[u8], ip: u64, required: usize) -> usize {
    let mut decoder = Decoder::with_ip(bitness, code, ip, DecoderOptions::NONE);
    let mut covered = 0;
    for inst in decoder.iter() {
        if inst.is_invalid() {
            return covered;
        }
        match inst.flow_control() {
            // int3 fill after a call that doesn't return
            FlowControl::Interrupt => break,
            FlowControl::Return | FlowControl::UnconditionalBranch | FlowControl::IndirectBranch => {
                covered += inst.len();
                break;
            }
            _ => covered += inst.len(),
        }
        if covered >= required {
            return covered;
        }
    }
    covered + fill_len(&code[covered..], ip + covered as u64)
}

// The next function starts at a boundary, so int3/nop fill up to it is free to overwrite.
fn fill_len(code: &[u8], ip: u64) -> usize {
    let to_boundary = (ip.next_multiple_of(FUNCTION_ALIGN) - ip) as usize;
    code.iter()
        .take(to_boundary)
        .take_while(|&&b| b == INT3 || b == NOP)
        .count()
}
