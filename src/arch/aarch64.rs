pub(super) const LDR_BR_LEN: usize = 16;

// ldr x16, #8
const LDR_X16_LITERAL_8: u32 = 0x5800_0050;
// br x16
const BR_X16: u32 = 0xd61f_0200;

const NOP: u32 = 0xd503_201f;
const FUNCTION_ALIGN: u64 = 16;

const RET_X30: u32 = 0xd65f_03c0;
const B_MASK: u32 = 0xfc00_0000;
const B_IMM26: u32 = 0x1400_0000;
const BR_MASK: u32 = 0xffff_fc1f;
const BR_XN: u32 = 0xd61f_0000;
const RET_XN: u32 = 0xd65f_0000;

pub(super) fn ldr_br(dest: u64) -> [u8; LDR_BR_LEN] {
    let mut buf = [0u8; LDR_BR_LEN];
    buf[..4].copy_from_slice(&LDR_X16_LITERAL_8.to_le_bytes());
    buf[4..8].copy_from_slice(&BR_X16.to_le_bytes());
    buf[8..].copy_from_slice(&dest.to_le_bytes());
    buf
}

fn leaves_function(word: u32) -> bool {
    word == RET_X30
        || word & B_MASK == B_IMM26
        || word & BR_MASK == BR_XN
        || word & BR_MASK == RET_XN
}

pub(super) fn patchable_len(code: &[u8], ip: u64, required: usize) -> usize {
    let mut covered = 0;
    for word in words(code) {
        // udf #0 fill
        if word == 0 {
            break;
        }
        covered += 4;
        if covered >= required {
            return covered;
        }
        if leaves_function(word) {
            break;
        }
    }
    covered + fill_len(&code[covered..], ip + covered as u64)
}

// udf #0 or nop words up to the boundary the next function starts at
fn fill_len(code: &[u8], ip: u64) -> usize {
    let to_boundary = (ip.next_multiple_of(FUNCTION_ALIGN) - ip) as usize;
    words(code)
        .take(to_boundary / 4)
        .take_while(|&word| word == 0 || word == NOP)
        .count()
        * 4
}

fn words(code: &[u8]) -> impl Iterator<Item = u32> + '_ {
    code.chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
}
