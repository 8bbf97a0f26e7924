pub mod common;
pub mod error;
mod structures;

use common::bounding_box;
use common::dequantize_coord;
use common::quantize_coord;
use common::DEFAULT_COLOR;
use common::Q_MAX;
use error::PczError;
use std::io::{Cursor, Write};
use structures::ContainerView;
use structures::PackedCloud;
use structures::FLAG_SYNTHESIZED_COLOR;
use structures::HEADER_SIZE;
use structures::MAGIC;
use structures::VERSION;
use zstd::stream::{decode_all, Encoder};

pub use structures::{DecodedCloud, PointCloud, QuantizationTransform};

/// Computes the shared quantization transform from the cloud's bounding
/// box and maps every coordinate to an i16 lane.
///
/// The global scale spans the widest axis across [0, Q_MAX]. A cloud
/// whose bounding box has zero range on all axes (single point, or all
/// points coincident) gets scale 1.0, so every quantized offset is zero
/// and reconstruction returns the exact coordinates. An empty cloud
/// yields the neutral transform (min = 0, scale = 1).
fn quantize_positions(positions: &[f64]) -> Result<(Vec<i16>, QuantizationTransform), PczError> {
    if positions.is_empty() {
        return Ok((
            Vec::new(),
            QuantizationTransform {
                min: [0.0; 3],
                scale: 1.0,
            },
        ));
    }

    // f64::min/max skip NaN operands, so the bounding box cannot be
    // trusted to surface them; check the coordinates themselves.
    if !positions.iter().all(|v| v.is_finite()) {
        return Err(PczError::DegenerateGeometry(
            "input contains a non-finite coordinate".to_string(),
        ));
    }

    let (min, max) = bounding_box(positions);
    let range = (max[0] - min[0])
        .max(max[1] - min[1])
        .max(max[2] - min[2]);
    if !range.is_finite() {
        return Err(PczError::DegenerateGeometry(
            "bounding box range overflows f64".to_string(),
        ));
    }
    let scale = if range > 0.0 {
        Q_MAX as f64 / range
    } else {
        1.0
    };

    let quantized = positions
        .chunks_exact(3)
        .flat_map(|point| {
            [
                quantize_coord(point[0], min[0], scale),
                quantize_coord(point[1], min[1], scale),
                quantize_coord(point[2], min[2], scale),
            ]
        })
        .collect();

    Ok((quantized, QuantizationTransform { min, scale }))
}

/// Validates the input arrays, quantizes positions and lays both
/// attributes out as contiguous byte buffers: 3 little-endian i16 per
/// point, then 3 u8 color channels per point. Clouds without colors get
/// full white and the synthesized flag.
fn pack_cloud(cloud: &PointCloud) -> Result<PackedCloud, PczError> {
    if cloud.positions.len() % 3 != 0 {
        return Err(PczError::InvalidInput(format!(
            "position array length {} is not a multiple of 3",
            cloud.positions.len()
        )));
    }
    let num_points = cloud.positions.len() / 3;
    let num_points = u32::try_from(num_points).map_err(|_| {
        PczError::InvalidInput(format!("point count {} exceeds u32 range", num_points))
    })?;
    if let Some(colors) = &cloud.colors {
        if colors.len() != cloud.positions.len() {
            return Err(PczError::InvalidInput(format!(
                "color array holds {} values for {} position values",
                colors.len(),
                cloud.positions.len()
            )));
        }
    }

    let (quantized, transform) = quantize_positions(&cloud.positions)?;

    let positions: Vec<u8> = quantized.iter().flat_map(|q| q.to_le_bytes()).collect();

    let (colors, synthesized_color) = match &cloud.colors {
        Some(colors) => (colors.clone(), false),
        None => {
            let mut white = Vec::with_capacity(num_points as usize * 3);
            for _ in 0..num_points {
                white.extend_from_slice(&DEFAULT_COLOR);
            }
            (white, true)
        }
    };

    Ok(PackedCloud {
        num_points,
        transform,
        synthesized_color,
        positions,
        colors,
    })
}

#[inline(never)]
fn compress_zstd(data: &[u8], level: u32, workers: u32) -> Result<Vec<u8>, PczError> {
    let mut encoder = Encoder::new(Vec::new(), level as i32)
        .map_err(|e| PczError::ZstdCompress(format!("Encoder creation failed: {}", e)))?;
    encoder
        .multithread(workers)
        .map_err(|e| PczError::ZstdCompress(format!("Setting multithread failed: {}", e)))?;
    encoder
        .write_all(data)
        .map_err(|e| PczError::ZstdCompress(format!("Writing data failed: {}", e)))?;

    let compressed_data = encoder
        .finish()
        .map_err(|e| PczError::ZstdCompress(format!("Finalizing compression failed: {}", e)))?;
    Ok(compressed_data)
}

#[inline(never)]
fn decompress_zstd(data: &[u8], what: &str) -> Result<Vec<u8>, PczError> {
    decode_all(Cursor::new(data))
        .map_err(|e| PczError::CorruptContainer(format!("{} block decompression failed: {}", what, e)))
}

fn assemble_container(
    packed: &PackedCloud,
    compressed_positions: &[u8],
    compressed_colors: &[u8],
) -> Result<Vec<u8>, PczError> {
    let positions_len = u32::try_from(compressed_positions.len()).map_err(|_| {
        PczError::InvalidInput("compressed position block exceeds u32 range".to_string())
    })?;
    let colors_len = u32::try_from(compressed_colors.len()).map_err(|_| {
        PczError::InvalidInput("compressed color block exceeds u32 range".to_string())
    })?;

    let mut out = Vec::with_capacity(
        HEADER_SIZE + 8 + compressed_positions.len() + compressed_colors.len(),
    );
    out.extend_from_slice(&MAGIC.to_le_bytes());
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&packed.num_points.to_le_bytes());
    out.push(if packed.synthesized_color {
        FLAG_SYNTHESIZED_COLOR
    } else {
        0
    });
    out.extend_from_slice(&[0u8; 3]);
    for min in packed.transform.min {
        out.extend_from_slice(&min.to_le_bytes());
    }
    out.extend_from_slice(&packed.transform.scale.to_le_bytes());

    out.extend_from_slice(&positions_len.to_le_bytes());
    out.extend_from_slice(compressed_positions);
    out.extend_from_slice(&colors_len.to_le_bytes());
    out.extend_from_slice(compressed_colors);
    Ok(out)
}

#[inline]
fn read_u32(data: &[u8], offset: usize, what: &str) -> Result<u32, PczError> {
    let bytes = data
        .get(offset..offset + 4)
        .ok_or_else(|| PczError::CorruptContainer(format!("container truncated at {}", what)))?;
    Ok(u32::from_le_bytes(bytes.try_into().map_err(|e| {
        PczError::CorruptContainer(format!("byte conversion error for {}: {}", what, e))
    })?))
}

#[inline]
fn read_f64(data: &[u8], offset: usize, what: &str) -> Result<f64, PczError> {
    let bytes = data
        .get(offset..offset + 8)
        .ok_or_else(|| PczError::CorruptContainer(format!("container truncated at {}", what)))?;
    Ok(f64::from_le_bytes(bytes.try_into().map_err(|e| {
        PczError::CorruptContainer(format!("byte conversion error for {}: {}", what, e))
    })?))
}

#[inline]
fn read_block<'a>(data: &'a [u8], offset: &mut usize, what: &str) -> Result<&'a [u8], PczError> {
    let len = read_u32(data, *offset, what)? as usize;
    let start = *offset + 4;
    let end = start
        .checked_add(len)
        .ok_or_else(|| PczError::CorruptContainer(format!("{} block length overflow", what)))?;
    let block = data.get(start..end).ok_or_else(|| {
        PczError::CorruptContainer(format!(
            "{} block of {} bytes overruns the container",
            what, len
        ))
    })?;
    *offset = end;
    Ok(block)
}

fn parse_container(data: &[u8]) -> Result<ContainerView, PczError> {
    if data.len() < HEADER_SIZE {
        return Err(PczError::CorruptContainer(format!(
            "need at least {} header bytes, have {}",
            HEADER_SIZE,
            data.len()
        )));
    }

    let magic = read_u32(data, 0, "magic")?;
    let version = read_u32(data, 4, "version")?;
    let num_points = read_u32(data, 8, "num_points")?;
    let flags = data[12];

    if magic != MAGIC {
        return Err(PczError::CorruptContainer(
            "invalid magic number".to_string(),
        ));
    }
    if version != VERSION {
        return Err(PczError::CorruptContainer(format!(
            "unsupported version {}",
            version
        )));
    }

    let min = [
        read_f64(data, 16, "min_x")?,
        read_f64(data, 24, "min_y")?,
        read_f64(data, 32, "min_z")?,
    ];
    let scale = read_f64(data, 40, "scale")?;
    if !scale.is_finite() || scale <= 0.0 {
        return Err(PczError::CorruptContainer(format!(
            "quantization scale {} is not usable",
            scale
        )));
    }

    let mut offset = HEADER_SIZE;
    let positions = read_block(data, &mut offset, "position")?;
    let colors = read_block(data, &mut offset, "color")?;
    if offset != data.len() {
        return Err(PczError::CorruptContainer(format!(
            "{} trailing bytes after color block",
            data.len() - offset
        )));
    }

    Ok(ContainerView {
        num_points,
        transform: QuantizationTransform { min, scale },
        synthesized_color: flags & FLAG_SYNTHESIZED_COLOR != 0,
        positions,
        colors,
    })
}

/// Validates decompressed block lengths against the header point count,
/// then inverts packing and quantization. Colors pass through verbatim.
fn reconstruct_cloud(
    view: &ContainerView,
    packed_positions: Vec<u8>,
    colors: Vec<u8>,
) -> Result<DecodedCloud, PczError> {
    let np = view.num_points as usize;
    let expected_positions = np
        .checked_mul(6)
        .ok_or_else(|| PczError::CorruptContainer("point count overflow".to_string()))?;
    if packed_positions.len() != expected_positions {
        return Err(PczError::CorruptContainer(format!(
            "position block decompressed to {} bytes, expected {}",
            packed_positions.len(),
            expected_positions
        )));
    }
    if colors.len() != np * 3 {
        return Err(PczError::CorruptContainer(format!(
            "color block decompressed to {} bytes, expected {}",
            colors.len(),
            np * 3
        )));
    }

    let min = view.transform.min;
    let scale = view.transform.scale;
    let mut positions = Vec::with_capacity(np * 3);
    for chunk in packed_positions.chunks_exact(6) {
        let x = i16::from_le_bytes([chunk[0], chunk[1]]);
        let y = i16::from_le_bytes([chunk[2], chunk[3]]);
        let z = i16::from_le_bytes([chunk[4], chunk[5]]);

        positions.push(dequantize_coord(x, min[0], scale));
        positions.push(dequantize_coord(y, min[1], scale));
        positions.push(dequantize_coord(z, min[2], scale));
    }

    Ok(DecodedCloud {
        positions,
        colors,
        synthesized_color: view.synthesized_color,
    })
}

/// Encodes a point cloud into a self-contained container: header with
/// the quantization transform, then the zstd-compressed position and
/// color blocks. The input is not mutated and the output is
/// byte-identical across repeated calls with the same configuration.
pub fn encode(
    cloud: &PointCloud,
    compression_level: u32,
    workers: u32,
    output: &mut Vec<u8>,
) -> Result<(), PczError> {
    let packed = pack_cloud(cloud)?;
    let compressed_positions = compress_zstd(&packed.positions, compression_level, workers)?;
    let compressed_colors = compress_zstd(&packed.colors, compression_level, workers)?;
    let container = assemble_container(&packed, &compressed_positions, &compressed_colors)?;
    output.clear();
    output.extend_from_slice(&container);
    Ok(())
}

/// Decodes a container produced by [`encode`]. Reconstructed positions
/// are within half a quantization step of the originals; colors are
/// exact. Truncated or otherwise malformed containers are rejected with
/// [`PczError::CorruptContainer`] and never panic or read out of
/// bounds.
pub fn decode(container: &[u8]) -> Result<DecodedCloud, PczError> {
    let view = parse_container(container)?;
    let packed_positions = decompress_zstd(view.positions, "position")?;
    let colors = decompress_zstd(view.colors, "color")?;
    reconstruct_cloud(&view, packed_positions, colors)
}

cfg_if::cfg_if! {
if #[cfg(feature = "async")] {
    use async_compression::zstd::CParameter;
    use async_compression::Level;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use async_compression::tokio::bufread::ZstdDecoder;
    use async_compression::tokio::write::ZstdEncoder;
    use tokio::io::BufReader;

    #[inline(never)]
    async fn compress_zstd_async(
        data: &[u8],
        level: u32,
        workers: u32,
    ) -> Result<Vec<u8>, PczError> {
        let mut compressed = Vec::new();
        let params = &[CParameter::nb_workers(workers)];
        let mut encoder = ZstdEncoder::with_quality_and_params(
            &mut compressed,
            Level::Precise(level as i32),
            params,
        );

        encoder.write_all(data)
            .await
            .map_err(|e| PczError::ZstdCompress(e.to_string()))?;

        encoder.shutdown()
            .await
            .map_err(|e| PczError::ZstdCompress(e.to_string()))?;

        Ok(compressed)
    }

    #[inline(never)]
    async fn decompress_zstd_async(data: &[u8], what: &str) -> Result<Vec<u8>, PczError> {
        let cursor = Cursor::new(data);
        let reader = BufReader::new(cursor);
        let mut decoder = ZstdDecoder::new(reader);
        let mut decompressed = Vec::new();

        decoder.read_to_end(&mut decompressed)
            .await
            .map_err(|e| {
                PczError::CorruptContainer(format!("{} block decompression failed: {}", what, e))
            })?;

        Ok(decompressed)
    }

    /// Asynchronous variant of [`encode`]; quantization and packing run
    /// inline, only the compression stage awaits.
    pub async fn encode_async(
        cloud: &PointCloud,
        compression_level: u32,
        workers: u32,
        output: &mut Vec<u8>,
    ) -> Result<(), PczError> {
        let packed = pack_cloud(cloud)?;
        let compressed_positions =
            compress_zstd_async(&packed.positions, compression_level, workers).await?;
        let compressed_colors =
            compress_zstd_async(&packed.colors, compression_level, workers).await?;
        let container = assemble_container(&packed, &compressed_positions, &compressed_colors)?;
        output.clear();
        output.extend_from_slice(&container);
        Ok(())
    }

    /// Asynchronous variant of [`decode`].
    pub async fn decode_async(container: &[u8]) -> Result<DecodedCloud, PczError> {
        let view = parse_container(container)?;
        let packed_positions = decompress_zstd_async(view.positions, "position").await?;
        let colors = decompress_zstd_async(view.colors, "color").await?;
        reconstruct_cloud(&view, packed_positions, colors)
    }
}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_cloud() -> PointCloud {
        let positions = vec![
            0.0, -1.25, 3.5, //
            10.2, 4.75, -2.125, //
            -7.5, 8.0, 1.0, //
            3.375, -6.5, 9.25,
        ];
        let colors = vec![
            255, 0, 0, //
            0, 255, 0, //
            0, 0, 255, //
            10, 20, 30,
        ];
        PointCloud {
            positions,
            colors: Some(colors),
        }
    }

    fn encode_to_vec(cloud: &PointCloud) -> Vec<u8> {
        let mut out = Vec::new();
        encode(cloud, 3, 1, &mut out).expect("encode(...) failed");
        out
    }

    #[test]
    fn round_trip_positions_within_half_quantization_step() {
        let cloud = sample_cloud();
        let decoded = decode(&encode_to_vec(&cloud)).expect("decode(...) failed");

        assert_eq!(decoded.num_points(), cloud.num_points());
        // Widest axis is x: -7.5 .. 10.2.
        let half_step = 0.5 * (10.2f64 - (-7.5)) / Q_MAX as f64;
        for (reconstructed, original) in decoded.positions.iter().zip(&cloud.positions) {
            assert!(
                (reconstructed - original).abs() <= half_step + 1e-12,
                "reconstructed {} too far from {}",
                reconstructed,
                original
            );
        }
        assert_eq!(Some(decoded.colors), cloud.colors);
        assert!(!decoded.synthesized_color);
    }

    #[test]
    fn encoding_is_deterministic() {
        let cloud = sample_cloud();
        assert_eq!(encode_to_vec(&cloud), encode_to_vec(&cloud));
    }

    #[test]
    fn empty_cloud_round_trips() {
        let decoded = decode(&encode_to_vec(&PointCloud::default())).expect("decode(...) failed");
        assert_eq!(decoded.num_points(), 0);
        assert!(decoded.positions.is_empty());
        assert!(decoded.colors.is_empty());
    }

    #[test]
    fn coincident_points_reconstruct_exactly() {
        let positions: Vec<f64> = std::iter::repeat([1.5, -2.0, 3.0])
            .take(5)
            .flatten()
            .collect();
        let cloud = PointCloud {
            positions: positions.clone(),
            colors: None,
        };

        let decoded = decode(&encode_to_vec(&cloud)).expect("decode(...) failed");
        // Zero range on every axis: scale stays 1.0 and offsets are all
        // zero, so the coordinates come back bit-exact.
        assert_eq!(decoded.positions, positions);
    }

    #[test]
    fn single_point_round_trips_exactly() {
        let cloud = PointCloud {
            positions: vec![-4.25, 0.5, 1024.0],
            colors: Some(vec![1, 2, 3]),
        };

        let decoded = decode(&encode_to_vec(&cloud)).expect("decode(...) failed");
        assert_eq!(decoded.positions, cloud.positions);
        assert_eq!(Some(decoded.colors), cloud.colors);
    }

    #[test]
    fn missing_colors_synthesize_white() {
        let cloud = PointCloud {
            positions: sample_cloud().positions,
            colors: None,
        };

        let decoded = decode(&encode_to_vec(&cloud)).expect("decode(...) failed");
        assert!(decoded.synthesized_color);
        assert_eq!(decoded.colors, vec![255u8; cloud.positions.len()]);
    }

    #[test]
    fn truncated_container_is_rejected() {
        let bytes = encode_to_vec(&sample_cloud());
        for len in 0..bytes.len() {
            let err = decode(&bytes[..len]).expect_err("truncated container decoded");
            assert!(
                matches!(err, PczError::CorruptContainer(_)),
                "prefix of {} bytes gave {:?}",
                len,
                err
            );
        }
    }

    #[test]
    fn corrupted_payload_is_rejected() {
        let mut bytes = encode_to_vec(&sample_cloud());
        // First byte of the position block's zstd frame magic.
        bytes[HEADER_SIZE + 4] = 0;
        let err = decode(&bytes).expect_err("corrupted payload decoded");
        assert!(matches!(err, PczError::CorruptContainer(_)));
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let mut bytes = encode_to_vec(&sample_cloud());
        bytes[0] ^= 0xFF;
        let err = decode(&bytes).expect_err("bad magic decoded");
        assert!(matches!(err, PczError::CorruptContainer(_)));
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let mut bytes = encode_to_vec(&sample_cloud());
        bytes[4] = 0xFF;
        let err = decode(&bytes).expect_err("bad version decoded");
        assert!(matches!(err, PczError::CorruptContainer(_)));
    }

    #[test]
    fn bounding_box_max_is_clamped_to_q_max() {
        let positions = vec![
            0.0, 0.0, 0.0, //
            10.0, 5.0, 2.5,
        ];
        let (quantized, transform) =
            quantize_positions(&positions).expect("quantize_positions(...) failed");

        assert_eq!(transform.scale, Q_MAX as f64 / 10.0);
        assert_eq!(&quantized[0..3], &[0, 0, 0]);
        assert_eq!(quantized[3], Q_MAX);
    }

    #[test]
    fn mismatched_color_length_is_invalid_input() {
        let cloud = PointCloud {
            positions: vec![0.0; 6],
            colors: Some(vec![255; 3]),
        };
        let mut out = Vec::new();
        let err = encode(&cloud, 3, 1, &mut out).expect_err("mismatched colors encoded");
        assert!(matches!(err, PczError::InvalidInput(_)));
    }

    #[test]
    fn ragged_position_array_is_invalid_input() {
        let cloud = PointCloud {
            positions: vec![0.0; 7],
            colors: None,
        };
        let mut out = Vec::new();
        let err = encode(&cloud, 3, 1, &mut out).expect_err("ragged positions encoded");
        assert!(matches!(err, PczError::InvalidInput(_)));
    }

    #[test]
    fn non_finite_coordinates_are_degenerate_geometry() {
        let cloud = PointCloud {
            positions: vec![0.0, f64::NAN, 1.0],
            colors: None,
        };
        let mut out = Vec::new();
        let err = encode(&cloud, 3, 1, &mut out).expect_err("NaN coordinate encoded");
        assert!(matches!(err, PczError::DegenerateGeometry(_)));
    }

    #[cfg(feature = "async")]
    #[tokio::test]
    async fn async_round_trip() {
        let cloud = sample_cloud();

        let mut container = Vec::new();
        encode_async(&cloud, 1, 1, &mut container)
            .await
            .expect("encode_async(...) failed");

        let decoded = decode_async(&container)
            .await
            .expect("decode_async(...) failed");
        assert_eq!(decoded.num_points(), cloud.num_points());
        assert_eq!(Some(decoded.colors), cloud.colors);
    }
}
