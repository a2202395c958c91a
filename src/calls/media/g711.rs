//! G.711 μ-law (PCMU), the payload format of every call leg we build.

/// Compresses one 16-bit linear sample to μ-law.
pub fn ulaw_compress(sample: i16) -> u8 {
    let absno = if sample < 0 {
        (((!sample) as u16) >> 2) as i16 + 33
    } else {
        (sample >> 2) + 33
    };
    let absno = absno.min(0x1FFF);

    let mut i = absno >> 6;
    let mut segno = 1;
    while i != 0 {
        segno += 1;
        i >>= 1;
    }

    let high_nibble = 0x0008 - segno;
    let low_nibble = 0x000F - ((absno >> segno) & 0x000F);
    let mut result = (high_nibble << 4) | low_nibble;
    if sample >= 0 {
        result |= 0x0080;
    }
    result as u8
}

/// Expands one μ-law byte to a 16-bit linear sample.
pub fn ulaw_expand(compressed: u8) -> i16 {
    let sign = if compressed < 0x0080 { -1 } else { 1 };
    let mantissa = (!compressed) as i16;
    let exponent = (mantissa >> 4) & 0x0007;
    let segment = exponent + 1;
    let mantissa = mantissa & 0x000F;
    let step = 4 << segment;

    sign * ((0x0080 << exponent) + step * mantissa + step / 2 - 4 * 33)
}

pub fn encode(samples: &[i16]) -> Vec<u8> {
    samples.iter().map(|&s| ulaw_compress(s)).collect()
}

pub fn decode(payload: &[u8]) -> Vec<i16> {
    payload.iter().map(|&b| ulaw_expand(b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_and_extremes() {
        assert_eq!(ulaw_compress(0), 0xFF);
        assert_eq!(ulaw_expand(0xFF), 0);
        assert_eq!(ulaw_compress(i16::MAX), 0x80);
        assert_eq!(ulaw_compress(i16::MIN), 0x00);
        assert_eq!(ulaw_expand(0x80), 32124);
        assert_eq!(ulaw_expand(0x00), -32124);
    }

    #[test]
    fn test_quantization_error_is_bounded() {
        for sample in (-32000i16..32000).step_by(97) {
            let back = ulaw_expand(ulaw_compress(sample));
            let error = (i32::from(sample) - i32::from(back)).abs();
            // Largest μ-law step is 1024; the error stays within half of it.
            assert!(error <= 512, "sample {sample} came back as {back}");
            assert!(sample.signum() * back.signum() >= 0);
        }
    }
}
