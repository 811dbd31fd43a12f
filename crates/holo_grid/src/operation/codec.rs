//! Wire layout of the record-id carrying operations.
//!
//! ```text
//! tag:u8 | structure_len:u32 | structure | key_len:u32 | key
//!        | thread_id:u64 | caller_id:u64 | count:u32 | record_id:u64 * count
//! ```
//!
//! All integers are big-endian. Only record ids cross the wire; replicas
//! already hold the record payloads.

use crate::types::{RecordId, StructureKind};

use super::backup::{BackupEffect, BackupOperation};
use super::protocol::KeyTarget;
use super::remove_all::TxnRemoveAllOperation;

const TAG_TXN_REMOVE_ALL: u8 = 1;
const TAG_REMOVE_BACKUP: u8 = 2;

pub fn encode_txn_remove_all(op: &TxnRemoveAllOperation) -> Vec<u8> {
    encode(TAG_TXN_REMOVE_ALL, op.target(), op.record_ids())
}

pub fn decode_txn_remove_all(data: &[u8]) -> anyhow::Result<TxnRemoveAllOperation> {
    let (target, record_ids) = decode(TAG_TXN_REMOVE_ALL, data)?;
    Ok(TxnRemoveAllOperation::new(target, record_ids))
}

/// Encode the backup of a remove-all. Other backup effects carry payloads
/// and are not part of this format.
pub fn encode_remove_backup(op: &BackupOperation) -> anyhow::Result<Vec<u8>> {
    let BackupEffect::RemoveRecordIds { record_ids } = &op.effect else {
        anyhow::bail!("backup effect {:?} has no record-id wire form", op.effect);
    };
    anyhow::ensure!(
        op.kind == StructureKind::MultiMap,
        "record-id backups only target multimaps"
    );
    let target = KeyTarget::new(&op.structure, &op.key, op.caller_id, op.thread_id);
    Ok(encode(TAG_REMOVE_BACKUP, &target, record_ids))
}

pub fn decode_remove_backup(data: &[u8]) -> anyhow::Result<BackupOperation> {
    let (target, record_ids) = decode(TAG_REMOVE_BACKUP, data)?;
    Ok(BackupOperation {
        kind: StructureKind::MultiMap,
        structure: target.structure,
        key: target.key,
        caller_id: target.caller_id,
        thread_id: target.thread_id,
        effect: BackupEffect::RemoveRecordIds { record_ids },
    })
}

fn encode(tag: u8, target: &KeyTarget, record_ids: &[RecordId]) -> Vec<u8> {
    let size = 1 + 4 + target.structure.len() + 4 + target.key.len() + 8 + 8 + 4 + 8 * record_ids.len();
    let mut out = Vec::with_capacity(size);
    out.push(tag);
    out.extend_from_slice(&(target.structure.len() as u32).to_be_bytes());
    out.extend_from_slice(target.structure.as_bytes());
    out.extend_from_slice(&(target.key.len() as u32).to_be_bytes());
    out.extend_from_slice(&target.key);
    out.extend_from_slice(&target.thread_id.to_be_bytes());
    out.extend_from_slice(&target.caller_id.to_be_bytes());
    out.extend_from_slice(&(record_ids.len() as u32).to_be_bytes());
    for id in record_ids {
        out.extend_from_slice(&id.to_be_bytes());
    }
    out
}

fn decode(expected_tag: u8, data: &[u8]) -> anyhow::Result<(KeyTarget, Vec<RecordId>)> {
    let mut offset = 0usize;
    let tag = read_u8(data, &mut offset)?;
    anyhow::ensure!(tag == expected_tag, "unexpected operation tag {tag} (expected {expected_tag})");

    let structure_len = read_u32(data, &mut offset)? as usize;
    anyhow::ensure!(offset + structure_len <= data.len(), "short structure name");
    let structure = std::str::from_utf8(&data[offset..offset + structure_len])?.to_string();
    offset += structure_len;

    let key_len = read_u32(data, &mut offset)? as usize;
    anyhow::ensure!(offset + key_len <= data.len(), "short key");
    let key = data[offset..offset + key_len].to_vec();
    offset += key_len;

    let thread_id = read_u64(data, &mut offset)?;
    let caller_id = read_u64(data, &mut offset)?;
    let count = read_u32(data, &mut offset)? as usize;
    anyhow::ensure!(
        count.checked_mul(8).is_some_and(|n| offset + n <= data.len()),
        "short record id list"
    );
    let mut record_ids = Vec::with_capacity(count);
    for _ in 0..count {
        record_ids.push(read_u64(data, &mut offset)?);
    }
    anyhow::ensure!(offset == data.len(), "trailing bytes after record id list");

    Ok((
        KeyTarget {
            structure,
            key,
            caller_id,
            thread_id,
        },
        record_ids,
    ))
}

fn read_u8(data: &[u8], offset: &mut usize) -> anyhow::Result<u8> {
    anyhow::ensure!(*offset < data.len(), "short u8");
    let out = data[*offset];
    *offset += 1;
    Ok(out)
}

fn read_u32(data: &[u8], offset: &mut usize) -> anyhow::Result<u32> {
    anyhow::ensure!(*offset + 4 <= data.len(), "short u32");
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[*offset..*offset + 4]);
    *offset += 4;
    Ok(u32::from_be_bytes(buf))
}

fn read_u64(data: &[u8], offset: &mut usize) -> anyhow::Result<u64> {
    anyhow::ensure!(*offset + 8 <= data.len(), "short u64");
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[*offset..*offset + 8]);
    *offset += 8;
    Ok(u64::from_be_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remove_all_layout_puts_count_before_ids() {
        let op = TxnRemoveAllOperation::new(KeyTarget::new("mm", b"k", 0x0102, 0x0304), vec![7, 9]);
        let bytes = encode_txn_remove_all(&op);

        assert_eq!(bytes[0], TAG_TXN_REMOVE_ALL);
        let tail = &bytes[bytes.len() - (4 + 16)..];
        assert_eq!(&tail[..4], &2u32.to_be_bytes());
        assert_eq!(&tail[4..12], &7u64.to_be_bytes());

        let decoded = decode_txn_remove_all(&bytes).expect("decode");
        assert_eq!(decoded.target(), op.target());
        assert_eq!(decoded.record_ids(), &[7, 9]);
    }

    #[test]
    fn truncated_and_mistagged_input_is_rejected() {
        let op = TxnRemoveAllOperation::new(KeyTarget::new("mm", b"k", 1, 2), vec![1, 2, 3]);
        let bytes = encode_txn_remove_all(&op);

        let err = decode_txn_remove_all(&bytes[..bytes.len() - 3]).expect_err("truncated");
        assert!(err.to_string().contains("short"));
        assert!(decode_remove_backup(&bytes).is_err(), "tag mismatch");

        let mut padded = bytes.clone();
        padded.push(0);
        assert!(decode_txn_remove_all(&padded).is_err());
    }

    #[test]
    fn only_remove_backups_have_a_wire_form() {
        let mut backup = BackupOperation {
            kind: StructureKind::MultiMap,
            structure: "mm".to_string(),
            key: b"k".to_vec(),
            caller_id: 4,
            thread_id: 5,
            effect: BackupEffect::RemoveRecordIds { record_ids: vec![3] },
        };
        let bytes = encode_remove_backup(&backup).expect("encode");
        assert_eq!(decode_remove_backup(&bytes).expect("decode"), backup);

        backup.effect = BackupEffect::Unlock;
        assert!(encode_remove_backup(&backup).is_err());
    }
}
