//! Minimal PLY adapter for the CLI: binary_little_endian 1.0 vertex
//! clouds with float positions and optional uchar colors. Everything
//! else the format allows is out of scope here; unknown properties of
//! supported types are skipped by stride.

use foldhash::HashMap;
use foldhash::HashMapExt;
use pcz_lib::error::PczError;
use pcz_lib::{DecodedCloud, PointCloud};
use std::io::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PropType {
    Float,
    Uchar,
}

impl PropType {
    fn size(self) -> usize {
        match self {
            PropType::Float => 4,
            PropType::Uchar => 1,
        }
    }
}

#[inline]
fn next_line<'b>(buffer: &'b [u8], offset: &mut usize) -> Option<&'b [u8]> {
    if *offset >= buffer.len() {
        return None;
    }
    let start = *offset;

    match memchr::memchr(b'\n', &buffer[*offset..]) {
        Some(pos) => {
            *offset = start + pos + 1;
            Some(&buffer[start..start + pos])
        }
        None => {
            *offset = buffer.len();
            Some(&buffer[start..])
        }
    }
}

#[inline]
fn bytes_to_f32(data: &[u8], field_name: &str) -> Result<f32, PczError> {
    Ok(f32::from_le_bytes(data.try_into().map_err(|e| {
        PczError::InvalidInput(format!("Byte conversion error for {}: {}", field_name, e))
    })?))
}

/// Looks up a required float property and returns its byte offset
/// within a vertex record.
fn float_offset(
    fields: &HashMap<&str, (PropType, usize)>,
    name: &str,
) -> Result<usize, PczError> {
    match fields.get(name) {
        Some((PropType::Float, offset)) => Ok(*offset),
        Some((other, _)) => Err(PczError::UnsupportedAttribute(format!(
            "property {} has type {:?}, expected float",
            name, other
        ))),
        None => Err(PczError::InvalidInput(format!(
            "Missing required field: {}",
            name
        ))),
    }
}

/// Resolves the optional color attribute. All three channels present as
/// uchar yields their offsets; all three absent yields None; anything
/// in between cannot be represented in the container.
fn color_offsets(
    fields: &HashMap<&str, (PropType, usize)>,
) -> Result<Option<[usize; 3]>, PczError> {
    let channels = ["red", "green", "blue"];
    let present = channels.iter().filter(|c| fields.contains_key(*c)).count();
    if present == 0 {
        return Ok(None);
    }
    if present != 3 {
        return Err(PczError::UnsupportedAttribute(
            "incomplete color attribute (need red, green and blue)".to_string(),
        ));
    }

    let mut offsets = [0usize; 3];
    for (slot, name) in offsets.iter_mut().zip(channels) {
        match fields.get(name) {
            Some((PropType::Uchar, offset)) => *slot = *offset,
            Some((other, _)) => {
                return Err(PczError::UnsupportedAttribute(format!(
                    "property {} has type {:?}, expected uchar",
                    name, other
                )))
            }
            None => unreachable!(),
        }
    }
    Ok(Some(offsets))
}

pub fn parse_ply(raw_data: &[u8]) -> Result<PointCloud, PczError> {
    let mut offset = 0;

    // Line #1: "ply"
    let line1 = next_line(raw_data, &mut offset)
        .ok_or_else(|| PczError::InvalidInput("No 'ply' line".to_string()))?;
    if line1 != b"ply" {
        return Err(PczError::InvalidInput(
            "Not a .ply file (missing 'ply' header)".to_string(),
        ));
    }

    // Line #2: "format binary_little_endian 1.0"
    let line2 = next_line(raw_data, &mut offset)
        .ok_or_else(|| PczError::InvalidInput("Missing format line".to_string()))?;
    if line2 != b"format binary_little_endian 1.0" {
        return Err(PczError::InvalidInput(
            "Unsupported .ply format (only binary_little_endian 1.0 is supported)".to_string(),
        ));
    }

    // Line #3: "element vertex N" (comments may precede it)
    let mut line3 = next_line(raw_data, &mut offset)
        .ok_or_else(|| PczError::InvalidInput("Missing 'element vertex' line".to_string()))?;
    while line3.starts_with(b"comment ") {
        line3 = next_line(raw_data, &mut offset)
            .ok_or_else(|| PczError::InvalidInput("Missing 'element vertex' line".to_string()))?;
    }
    if !line3.starts_with(b"element vertex ") {
        return Err(PczError::InvalidInput(
            "Missing 'element vertex' definition".to_string(),
        ));
    }
    let num_str = &line3[b"element vertex ".len()..];
    let num_points: usize = {
        let s = std::str::from_utf8(num_str)
            .map_err(|e| PczError::InvalidInput(format!("UTF-8 error: {}", e)))?
            .trim();
        s.parse()
            .map_err(|e| PczError::InvalidInput(format!("Parse error: {}", e)))?
    };

    // Property list up to end_header: name, type and running offset.
    let mut field_names = Vec::new();
    let mut field_types = Vec::new();
    loop {
        let line = match next_line(raw_data, &mut offset) {
            Some(l) => l,
            None => {
                return Err(PczError::InvalidInput(
                    "No 'end_header' found before EOF".to_string(),
                ))
            }
        };

        if line.starts_with(b"end_header") {
            break;
        }
        if line.starts_with(b"comment ") {
            continue;
        }

        if let Some(raw_name) = line.strip_prefix(b"property float ") {
            field_names.push(raw_name);
            field_types.push(PropType::Float);
        } else if let Some(raw_name) = line.strip_prefix(b"property uchar ") {
            field_names.push(raw_name);
            field_types.push(PropType::Uchar);
        } else {
            return Err(PczError::UnsupportedAttribute(format!(
                "Unsupported property line: {:?}",
                line
            )));
        }
    }

    // Build field map: name -> (type, byte offset within a vertex).
    let mut field_map: HashMap<&str, (PropType, usize)> =
        HashMap::with_capacity(field_names.len());
    let mut stride = 0usize;
    for (&f_bytes, &f_type) in field_names.iter().zip(field_types.iter()) {
        let s = std::str::from_utf8(f_bytes)
            .map_err(|e| PczError::InvalidInput(format!("UTF-8 error in field name: {}", e)))?;
        field_map.insert(s, (f_type, stride));
        stride += f_type.size();
    }

    let ix = float_offset(&field_map, "x")?;
    let iy = float_offset(&field_map, "y")?;
    let iz = float_offset(&field_map, "z")?;
    let color = color_offsets(&field_map)?;

    let expected_bytes = num_points
        .checked_mul(stride)
        .ok_or_else(|| PczError::InvalidInput("Overflow in byte calculation".to_string()))?;
    if raw_data.len() < offset + expected_bytes {
        return Err(PczError::InvalidInput(format!(
            "Binary data is too short, need {} bytes, have {}",
            expected_bytes,
            raw_data.len() - offset
        )));
    }

    let data = &raw_data[offset..offset + expected_bytes];
    let mut positions = Vec::with_capacity(num_points * 3);
    let mut colors = color.map(|_| Vec::with_capacity(num_points * 3));

    for vertex_data in data.chunks_exact(stride).take(num_points) {
        let x = bytes_to_f32(&vertex_data[ix..ix + 4], "x")?;
        let y = bytes_to_f32(&vertex_data[iy..iy + 4], "y")?;
        let z = bytes_to_f32(&vertex_data[iz..iz + 4], "z")?;
        positions.extend_from_slice(&[x as f64, y as f64, z as f64]);

        if let (Some([ir, ig, ib]), Some(out)) = (color, colors.as_mut()) {
            out.extend_from_slice(&[vertex_data[ir], vertex_data[ig], vertex_data[ib]]);
        }
    }

    Ok(PointCloud { positions, colors })
}

pub fn write_ply(
    output: &mut Vec<u8>,
    cloud: &DecodedCloud,
    include_colors: bool,
) -> Result<(), PczError> {
    let num_points = cloud.num_points();

    output.clear();
    output.extend_from_slice(b"ply\nformat binary_little_endian 1.0\n");
    writeln!(output, "element vertex {}", num_points).map_err(PczError::IoError)?;
    output.extend_from_slice(b"property float x\nproperty float y\nproperty float z\n");
    if include_colors {
        output.extend_from_slice(
            b"property uchar red\nproperty uchar green\nproperty uchar blue\n",
        );
    }
    output.extend_from_slice(b"end_header\n");

    let point_size = 3 * 4 + if include_colors { 3 } else { 0 };
    output.reserve(num_points * point_size);

    for i in 0..num_points {
        let pos = [
            cloud.positions[i * 3] as f32,
            cloud.positions[i * 3 + 1] as f32,
            cloud.positions[i * 3 + 2] as f32,
        ];
        output.extend_from_slice(bytemuck::bytes_of(&pos));

        if include_colors {
            output.extend_from_slice(&cloud.colors[i * 3..i * 3 + 3]);
        }
    }
    Ok(())
}
