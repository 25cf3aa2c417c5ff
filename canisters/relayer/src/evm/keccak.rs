//! Keccak-256 as used by Ethereum (original Keccak padding, not SHA3).

const RATE: usize = 136;

const ROUND_CONSTANTS: [u64; 24] = [
    0x0000000000000001,
    0x0000000000008082,
    0x800000000000808a,
    0x8000000080008000,
    0x000000000000808b,
    0x0000000080000001,
    0x8000000080008081,
    0x8000000000008009,
    0x000000000000008a,
    0x0000000000000088,
    0x0000000080008009,
    0x000000008000000a,
    0x000000008000808b,
    0x800000000000008b,
    0x8000000000008089,
    0x8000000000008003,
    0x8000000000008002,
    0x8000000000000080,
    0x000000000000800a,
    0x800000008000000a,
    0x8000000080008081,
    0x8000000000008080,
    0x0000000080000001,
    0x8000000080008008,
];

const RHO_OFFSETS: [u32; 24] = [
    1, 3, 6, 10, 15, 21, 28, 36, 45, 55, 2, 14, 27, 41, 56, 8, 25, 43, 62, 18, 39, 61, 20, 44,
];

const PI_LANES: [usize; 24] = [
    10, 7, 11, 17, 18, 3, 5, 16, 8, 21, 24, 4, 15, 23, 19, 13, 12, 2, 20, 14, 22, 9, 6, 1,
];

fn permute(lanes: &mut [u64; 25]) {
    let mut columns = [0u64; 5];
    for &constant in ROUND_CONSTANTS.iter() {
        // theta
        for (x, column) in columns.iter_mut().enumerate() {
            *column = lanes[x] ^ lanes[x + 5] ^ lanes[x + 10] ^ lanes[x + 15] ^ lanes[x + 20];
        }
        for x in 0..5 {
            let d = columns[(x + 4) % 5] ^ columns[(x + 1) % 5].rotate_left(1);
            for y in (0..25).step_by(5) {
                lanes[x + y] ^= d;
            }
        }
        // rho + pi
        let mut carry = lanes[1];
        for (&target, &offset) in PI_LANES.iter().zip(RHO_OFFSETS.iter()) {
            let next = lanes[target];
            lanes[target] = carry.rotate_left(offset);
            carry = next;
        }
        // chi
        for y in (0..25).step_by(5) {
            columns.copy_from_slice(&lanes[y..y + 5]);
            for x in 0..5 {
                lanes[y + x] ^= !columns[(x + 1) % 5] & columns[(x + 2) % 5];
            }
        }
        // iota
        lanes[0] ^= constant;
    }
}

/// Incremental Keccak-256 hasher.
#[derive(Clone)]
pub struct Keccak256 {
    lanes: [u64; 25],
    buffer: [u8; RATE],
    buffered: usize,
}

impl Default for Keccak256 {
    fn default() -> Self {
        Self::new()
    }
}

impl Keccak256 {
    pub fn new() -> Self {
        Self {
            lanes: [0u64; 25],
            buffer: [0u8; RATE],
            buffered: 0,
        }
    }

    pub fn update(&mut self, mut input: &[u8]) -> &mut Self {
        while !input.is_empty() {
            let take = (RATE - self.buffered).min(input.len());
            self.buffer[self.buffered..self.buffered + take].copy_from_slice(&input[..take]);
            self.buffered += take;
            input = &input[take..];
            if self.buffered == RATE {
                self.absorb_buffer();
            }
        }
        self
    }

    pub fn finalize(mut self) -> [u8; 32] {
        self.buffer[self.buffered..].fill(0);
        self.buffer[self.buffered] = 0x01;
        self.buffer[RATE - 1] |= 0x80;
        self.absorb_buffer();

        let mut digest = [0u8; 32];
        for (chunk, lane) in digest.chunks_mut(8).zip(self.lanes.iter()) {
            chunk.copy_from_slice(&lane.to_le_bytes());
        }
        digest
    }

    fn absorb_buffer(&mut self) {
        for (lane, chunk) in self.lanes.iter_mut().zip(self.buffer.chunks(8)) {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            *lane ^= u64::from_le_bytes(word);
        }
        permute(&mut self.lanes);
        self.buffered = 0;
    }
}

pub fn keccak256(input: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(input);
    hasher.finalize()
}
