use num_bigint::BigUint;

/// Accumulates RLP-encoded items and wraps them into a list.
#[derive(Clone, Debug, Default)]
pub struct RlpList {
    payload: Vec<u8>,
}

impl RlpList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&mut self, data: &[u8]) -> &mut Self {
        encode_bytes_into(&mut self.payload, data);
        self
    }

    /// Integers are encoded big-endian with leading zeroes stripped.
    pub fn uint(&mut self, value: &BigUint) -> &mut Self {
        let bytes = value.to_bytes_be();
        self.bytes(trim_leading_zeroes(&bytes))
    }

    pub fn u64(&mut self, value: u64) -> &mut Self {
        let bytes = value.to_be_bytes();
        self.bytes(trim_leading_zeroes(&bytes))
    }

    pub fn list(&mut self, nested: &RlpList) -> &mut Self {
        self.payload.extend_from_slice(&nested.finish());
        self
    }

    pub fn finish(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.payload.len() + 9);
        write_header(&mut out, 0xc0, self.payload.len());
        out.extend_from_slice(&self.payload);
        out
    }
}

fn trim_leading_zeroes(data: &[u8]) -> &[u8] {
    let start = data.iter().position(|b| *b != 0).unwrap_or(data.len());
    &data[start..]
}

fn encode_bytes_into(out: &mut Vec<u8>, data: &[u8]) {
    if data.len() == 1 && data[0] < 0x80 {
        out.push(data[0]);
        return;
    }
    write_header(out, 0x80, data.len());
    out.extend_from_slice(data);
}

fn write_header(out: &mut Vec<u8>, offset: u8, len: usize) {
    if len <= 55 {
        out.push(offset + len as u8);
        return;
    }
    let len_bytes = (len as u64).to_be_bytes();
    let len_bytes = trim_leading_zeroes(&len_bytes);
    out.push(offset + 55 + len_bytes.len() as u8);
    out.extend_from_slice(len_bytes);
}
