//! Vectorised lane codec.
//!
//! The wire format is the 8x8 byte transpose defined in
//! [`pim_rank::lanes`]; this module is about doing it fast. The decode
//! path shuffles a loaded line with AVX2 gathers; the encode path builds
//! the line and streams it into the window with AVX-512 non-temporal
//! stores, which keeps 8 GiB windows from churning the cache. Every path
//! falls back to the scalar reference and is tested against it.
//!
//! Detection happens once per codec value, never per line.

use crate::region::RankRegion;
use pim_rank::lanes;
use tracing::trace;

/// Implementation selected for a codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    /// Portable reference, always available.
    Scalar,
    /// AVX2 gathers and shuffles for both directions.
    Avx2,
    /// AVX2 decode plus AVX-512 streaming encode.
    Avx512,
}

/// Lane transpose engine with the implementation fixed at construction.
#[derive(Debug, Clone, Copy)]
pub struct LaneCodec {
    kind: CodecKind,
}

impl LaneCodec {
    /// Pick the widest implementation the CPU offers.
    #[must_use]
    pub fn detect() -> Self {
        #[cfg(target_arch = "x86_64")]
        {
            let kind = if std::arch::is_x86_feature_detected!("avx512f")
                && std::arch::is_x86_feature_detected!("avx512bw")
                && std::arch::is_x86_feature_detected!("avx2")
            {
                CodecKind::Avx512
            } else if std::arch::is_x86_feature_detected!("avx2") {
                CodecKind::Avx2
            } else {
                CodecKind::Scalar
            };
            trace!("lane codec: {kind:?}");
            Self { kind }
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            trace!("lane codec: scalar (non-x86 host)");
            Self { kind: CodecKind::Scalar }
        }
    }

    /// Portable codec, for comparison runs and non-x86 hosts.
    #[must_use]
    pub const fn scalar() -> Self {
        Self { kind: CodecKind::Scalar }
    }

    /// Which implementation this codec runs.
    #[must_use]
    pub const fn kind(&self) -> CodecKind {
        self.kind
    }

    /// Unpack a loaded wire line into one word per interface.
    #[must_use]
    pub fn decode(&self, line: &[u64; 8]) -> [u64; 8] {
        match self.kind {
            CodecKind::Scalar => lanes::lanes_to_host(*line),
            #[cfg(target_arch = "x86_64")]
            CodecKind::Avx2 | CodecKind::Avx512 => {
                let mut out = [0u64; 8];
                // SAFETY: avx2 was detected when this kind was selected;
                // both arrays are 8 words.
                unsafe { x86::transpose_avx2(line.as_ptr(), out.as_mut_ptr()) };
                out
            }
            #[cfg(not(target_arch = "x86_64"))]
            CodecKind::Avx2 | CodecKind::Avx512 => lanes::lanes_to_host(*line),
        }
    }

    /// Pack one word per interface and store the wire line at `offset`.
    ///
    /// The AVX-512 path streams past the cache; callers fence once after
    /// their store loop ([`crate::region::memory_fence`]).
    pub fn encode_store(&self, words: &[u64; 8], region: &RankRegion, offset: u64) {
        match self.kind {
            #[cfg(target_arch = "x86_64")]
            CodecKind::Avx512 => {
                let dst = region.line_ptr(offset);
                // SAFETY: avx512f+bw were detected when this kind was
                // selected; line_ptr asserted 64-byte alignment and
                // bounds, which the streaming store requires.
                unsafe { x86::transpose_stream_avx512(words.as_ptr(), dst.cast::<u64>()) };
            }
            #[cfg(target_arch = "x86_64")]
            CodecKind::Avx2 => {
                let mut line = [0u64; 8];
                // SAFETY: avx2 detected at selection; arrays are 8 words.
                unsafe { x86::transpose_avx2(words.as_ptr(), line.as_mut_ptr()) };
                region.write_line(offset, &line);
            }
            _ => region.write_line(offset, &lanes::host_to_lanes(*words)),
        }
    }
}

#[cfg(target_arch = "x86_64")]
mod x86 {
    use core::arch::x86_64::{
        __m256i, _mm256_i32gather_epi32, _mm256_permutevar8x32_epi32, _mm256_set_epi8,
        _mm256_setr_epi32, _mm256_shuffle_epi8, _mm256_storeu_si256, _mm512_i32gather_epi32,
        _mm512_permutexvar_epi32, _mm512_set_epi64, _mm512_setr_epi32, _mm512_shuffle_epi8,
        _mm512_stream_si512,
    };

    /// 8x8 byte transpose of one 64-byte line.
    ///
    /// Two 32-byte gathers pull the even and odd dword columns, a byte
    /// shuffle transposes within 128-bit halves, and a dword permute
    /// stitches the halves into lane order.
    ///
    /// # Safety
    ///
    /// Caller verified `avx2`; `input` and `output` are valid for 64
    /// bytes each.
    #[target_feature(enable = "avx2")]
    pub(super) unsafe fn transpose_avx2(input: *const u64, output: *mut u64) {
        let tm = _mm256_set_epi8(
            15, 11, 7, 3, 14, 10, 6, 2, 13, 9, 5, 1, 12, 8, 4, 0, //
            15, 11, 7, 3, 14, 10, 6, 2, 13, 9, 5, 1, 12, 8, 4, 0,
        );
        let vindex = _mm256_setr_epi32(0, 8, 16, 24, 32, 40, 48, 56);
        let perm = _mm256_setr_epi32(0, 4, 1, 5, 2, 6, 3, 7);

        let src = input.cast::<u8>();
        let load0 = _mm256_i32gather_epi32::<1>(src.cast::<i32>(), vindex);
        let load1 = _mm256_i32gather_epi32::<1>(src.add(4).cast::<i32>(), vindex);

        let transpose0 = _mm256_shuffle_epi8(load0, tm);
        let transpose1 = _mm256_shuffle_epi8(load1, tm);

        let final0 = _mm256_permutevar8x32_epi32(transpose0, perm);
        let final1 = _mm256_permutevar8x32_epi32(transpose1, perm);

        let dst = output.cast::<u8>();
        _mm256_storeu_si256(dst.cast::<__m256i>(), final0);
        _mm256_storeu_si256(dst.add(32).cast::<__m256i>(), final1);
    }

    /// 8x8 byte transpose with a non-temporal 64-byte store.
    ///
    /// # Safety
    ///
    /// Caller verified `avx512f` and `avx512bw`; `input` is valid for 64
    /// bytes; `output` is valid for 64 bytes and 64-byte aligned (the
    /// streaming store faults on misalignment).
    #[target_feature(enable = "avx512f,avx512bw")]
    pub(super) unsafe fn transpose_stream_avx512(input: *const u64, output: *mut u64) {
        const SHUF_HI: i64 = 0x0f0b_0703_0e0a_0602_u64 as i64;
        const SHUF_LO: i64 = 0x0d09_0501_0c08_0400_u64 as i64;
        let mask = _mm512_set_epi64(
            SHUF_HI, SHUF_LO, SHUF_HI, SHUF_LO, SHUF_HI, SHUF_LO, SHUF_HI, SHUF_LO,
        );
        let vindex =
            _mm512_setr_epi32(0, 8, 16, 24, 32, 40, 48, 56, 4, 12, 20, 28, 36, 44, 52, 60);
        let perm = _mm512_setr_epi32(0, 4, 1, 5, 2, 6, 3, 7, 8, 12, 9, 13, 10, 14, 11, 15);

        let load = _mm512_i32gather_epi32::<1>(vindex, input.cast());
        let transpose = _mm512_shuffle_epi8(load, mask);
        let wire = _mm512_permutexvar_epi32(perm, transpose);

        _mm512_stream_si512(output.cast(), wire);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn splitmix(mut z: u64) -> u64 {
        z = z.wrapping_add(0x9e37_79b9_7f4a_7c15);
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^ (z >> 31)
    }

    fn sample_lines() -> Vec<[u64; 8]> {
        let mut lines = vec![[0u64; 8], [u64::MAX; 8]];
        for round in 0..32u64 {
            lines.push(std::array::from_fn(|i| splitmix(round * 8 + i as u64)));
        }
        lines
    }

    #[test]
    fn scalar_codec_round_trips() {
        let c = LaneCodec::scalar();
        for line in sample_lines() {
            assert_eq!(c.decode(&c.decode(&line)), line);
        }
    }

    #[test]
    fn detected_decode_matches_scalar() {
        let detected = LaneCodec::detect();
        let scalar = LaneCodec::scalar();
        for line in sample_lines() {
            assert_eq!(detected.decode(&line), scalar.decode(&line), "kind {:?}", detected.kind());
        }
    }

    #[test]
    fn detected_encode_matches_scalar() {
        let region = RankRegion::host_backed(4096).unwrap();
        let detected = LaneCodec::detect();
        let scalar = LaneCodec::scalar();
        for (i, line) in sample_lines().into_iter().enumerate() {
            let a = 64 * (i as u64 % 16);
            let b = 2048 + a;
            detected.encode_store(&line, &region, a);
            scalar.encode_store(&line, &region, b);
            crate::region::memory_fence();
            assert_eq!(region.read_line(a), region.read_line(b), "kind {:?}", detected.kind());
        }
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn avx2_matches_scalar_when_present() {
        if !std::arch::is_x86_feature_detected!("avx2") {
            eprintln!("avx2 not present; skipping");
            return;
        }
        let avx2 = LaneCodec { kind: CodecKind::Avx2 };
        let scalar = LaneCodec::scalar();
        for line in sample_lines() {
            assert_eq!(avx2.decode(&line), scalar.decode(&line));
        }
    }

    #[test]
    fn encode_then_decode_is_identity() {
        let region = RankRegion::host_backed(4096).unwrap();
        let codec = LaneCodec::detect();
        for line in sample_lines() {
            codec.encode_store(&line, &region, 512);
            crate::region::memory_fence();
            assert_eq!(codec.decode(&region.read_line(512)), line);
        }
    }
}
