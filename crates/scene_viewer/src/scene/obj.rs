//! Minimal OBJ reader for staged model files: vertex positions and faces
//! only, which is all the streamed models carry. Faces are flattened into a
//! plain triangle list (one vertex per corner, sequential indices).

use super::types::{LoadError, MeshData};
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

pub fn load_obj(path: &Path) -> Result<MeshData, LoadError> {
    let file = File::open(path)
        .map_err(|e| LoadError::Internal(format!("open {}: {e}", path.display())))?;
    parse_obj(BufReader::new(file))
}

/// Parse OBJ text into flat triangle-list buffers. Faces with more than
/// three corners are fan-triangulated; negative indices resolve relative to
/// the vertices seen so far, per the OBJ spec.
pub fn parse_obj<R: Read>(reader: R) -> Result<MeshData, LoadError> {
    let mut vertices: Vec<[f32; 3]> = Vec::new();
    let mut out = MeshData::default();

    for line in BufReader::new(reader).lines() {
        let line = line.map_err(|e| LoadError::ParseFailed(format!("read line: {e}")))?;
        let trimmed = line.trim();

        if let Some(rest) = trimmed.strip_prefix("v ") {
            let mut parts = rest.split_whitespace();
            let mut coord = || -> Result<f32, LoadError> {
                parts
                    .next()
                    .ok_or_else(|| bad("vertex with fewer than three coordinates"))?
                    .parse()
                    .map_err(|_| bad("non-numeric vertex coordinate"))
            };
            let (x, y, z) = (coord()?, coord()?, coord()?);
            if x.is_finite() && y.is_finite() && z.is_finite() {
                vertices.push([x, y, z]);
            }
        } else if let Some(rest) = trimmed.strip_prefix("f ") {
            let corners = rest
                .split_whitespace()
                .map(|token| resolve_index(token, vertices.len()))
                .collect::<Result<Vec<usize>, LoadError>>()?;
            if corners.len() < 3 {
                return Err(bad("face with fewer than three corners"));
            }

            for i in 1..corners.len() - 1 {
                for &corner in &[corners[0], corners[i], corners[i + 1]] {
                    let v = vertices
                        .get(corner)
                        .ok_or_else(|| bad("face index out of range"))?;
                    out.positions.extend_from_slice(v);
                    out.indices.push(out.indices.len() as u32);
                }
            }
        }
    }

    Ok(out)
}

/// Face corner tokens look like `7`, `7/1`, `7//3` or `-1`; only the leading
/// vertex index matters here.
fn resolve_index(token: &str, seen: usize) -> Result<usize, LoadError> {
    let head = token.split('/').next().unwrap_or("");
    let idx: i64 = head.parse().map_err(|_| bad("malformed face index"))?;

    if idx > 0 {
        Ok((idx - 1) as usize)
    } else if idx < 0 {
        let resolved = seen as i64 + idx;
        if resolved >= 0 {
            Ok(resolved as usize)
        } else {
            Err(bad("negative face index out of range"))
        }
    } else {
        Err(bad("zero face index"))
    }
}

#[cold]
fn bad(msg: &str) -> LoadError {
    LoadError::ParseFailed(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_triangles_and_quads() {
        let text = "\
# comment
v 0.0 0.0 0.0
v 1.0 0.0 0.0
v 1.0 1.0 0.0
v 0.0 1.0 0.0
f 1 2 3 4
";
        let mesh = parse_obj(text.as_bytes()).unwrap();
        // Quad fans into two triangles, three corners each.
        assert_eq!(mesh.vertex_count(), 6);
        assert_eq!(mesh.indices, (0..6).collect::<Vec<u32>>());
        assert_eq!(&mesh.positions[..3], &[0.0, 0.0, 0.0]);
        assert_eq!(&mesh.positions[9..12], &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn accepts_slash_forms_and_negative_indices() {
        let text = "\
v 0 0 0
v 1 0 0
v 0 1 0
f 1/1/1 2//2 -1
";
        let mesh = parse_obj(text.as_bytes()).unwrap();
        assert_eq!(mesh.vertex_count(), 3);
        assert_eq!(&mesh.positions[6..9], &[0.0, 1.0, 0.0]);
    }

    #[test]
    fn empty_input_is_an_empty_mesh() {
        let mesh = parse_obj(&b""[..]).unwrap();
        assert_eq!(mesh.vertex_count(), 0);
        assert!(mesh.indices.is_empty());
    }

    #[test]
    fn out_of_range_face_index_fails() {
        let err = parse_obj(&b"v 0 0 0\nf 1 2 3\n"[..]).unwrap_err();
        assert!(matches!(err, LoadError::ParseFailed(_)));
    }

    #[test]
    fn degenerate_face_fails() {
        let err = parse_obj(&b"v 0 0 0\nv 1 0 0\nf 1 2\n"[..]).unwrap_err();
        assert!(matches!(err, LoadError::ParseFailed(_)));
    }
}
