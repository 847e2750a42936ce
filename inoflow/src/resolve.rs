use inoflow_common::{cstr, FILEPATH_LEN_MAX, FILEPATH_NODE_MAX};

use crate::hook::Dentry;

/// Reconstruct the absolute directory path of `leaf` into `out`.
///
/// Walks the parent chain (the leaf's own name is carried separately by the
/// record), stopping at the root — a missing parent link or a self-equal
/// inode — or after `FILEPATH_NODE_MAX` components, whichever comes first.
/// Components are written root-to-leaf with `/` separators. The buffer is
/// never overrun and the result is always NUL-terminated; overlong input is
/// truncated, never an error.
pub fn resolve_dir_path(leaf: &Dentry, out: &mut [u8; FILEPATH_LEN_MAX]) {
    out.fill(0);

    let mut stack: [Option<&[u8]>; FILEPATH_NODE_MAX] = [None; FILEPATH_NODE_MAX];
    let mut depth = 0;
    let mut cur = leaf.parent();
    while let Some(node) = cur {
        if depth == FILEPATH_NODE_MAX {
            break;
        }
        let at_root = match node.parent() {
            None => true,
            Some(parent) => node.meta().ino != 0 && node.meta().ino == parent.meta().ino,
        };
        if at_root {
            break;
        }
        stack[depth] = Some(node.name());
        depth += 1;
        cur = node.parent();
    }

    // Reserve the final byte so the terminator survives any truncation.
    let cap = FILEPATH_LEN_MAX - 1;
    let mut offset = 0;
    out[offset] = b'/';
    offset += 1;
    for idx in (0..depth).rev() {
        let name = cstr(stack[idx].unwrap_or(b""));
        let room = cap - offset;
        let n = name.len().min(room);
        out[offset..offset + n].copy_from_slice(&name[..n]);
        offset += n;
        if idx > 0 && offset < cap {
            out[offset] = b'/';
            offset += 1;
        }
        if offset == cap {
            break;
        }
    }
    // Drop a dangling separator left by a truncated component.
    if offset > 1 && out[offset - 1] == b'/' {
        out[offset - 1] = 0;
    }
}
