//! Identifier and raw-value operators.

use crate::compiler::DocumentGenerator;
use crate::context::GenContext;
use crate::generators::doc_i64;
use bson::spec::BinarySubtype;
use bson::{Binary, Bson};
use rand::Rng;
use std::sync::atomic::{AtomicI64, Ordering};
use uuid::Uuid;

/// `%objectid`
pub fn object_id() -> Bson {
    Bson::ObjectId(bson::oid::ObjectId::new())
}

/// `%bool`
pub fn boolean(ctx: &mut GenContext) -> Bson {
    Bson::Boolean(ctx.rng.random())
}

// process-wide counter shared by every worker
static SEQUENCE: AtomicI64 = AtomicI64::new(0);

/// `%sequence`: monotonic counter shared across all workers.
pub fn sequence() -> Bson {
    Bson::Int64(SEQUENCE.fetch_add(1, Ordering::Relaxed))
}

/// `%workerSequence`: monotonic counter private to the calling worker.
pub fn worker_sequence(ctx: &mut GenContext) -> Bson {
    Bson::Int64(ctx.next_worker_sequence())
}

/// `%binary`: `size` random bytes (default 512), or their uppercase hex
/// rendering with `as: "hex"`.
pub fn binary(params: &DocumentGenerator, ctx: &mut GenContext) -> Bson {
    let p = params.generate_document(ctx);
    let size = doc_i64(&p, "size").unwrap_or(512).max(0) as usize;
    let mut bytes = vec![0u8; size];
    ctx.rng.fill(&mut bytes[..]);

    if p.get_str("as") == Ok("hex") {
        return Bson::String(to_hex(&bytes));
    }
    Bson::Binary(Binary {
        subtype: BinarySubtype::Generic,
        bytes,
    })
}

fn to_hex(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0x0f) as usize] as char);
    }
    out
}

/// `%uuidString`
pub fn uuid_string() -> Bson {
    Bson::String(Uuid::new_v4().to_string())
}

/// `%uuidBinary`: UUID stored as binary subtype 4.
pub fn uuid_binary() -> Bson {
    Bson::Binary(Binary {
        subtype: BinarySubtype::Uuid,
        bytes: Uuid::new_v4().into_bytes().to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TemplateState;
    use bson::bson;
    use std::sync::Arc;

    fn ctx() -> GenContext {
        GenContext::new(Arc::new(TemplateState::default()), "test", 0)
    }

    #[test]
    fn test_sequence_is_strictly_increasing() {
        let Bson::Int64(a) = sequence() else {
            panic!("expected an i64");
        };
        let Bson::Int64(b) = sequence() else {
            panic!("expected an i64");
        };
        assert!(b > a);
    }

    #[test]
    fn test_binary_size_and_hex() {
        let mut ctx = ctx();
        let compiler = crate::compiler::Compiler::default();
        let gen = compiler
            .compile(&bson!({ "%binary": { "size": 16 } }))
            .unwrap();
        let Bson::Binary(bin) = gen.generate(&mut ctx) else {
            panic!("expected binary");
        };
        assert_eq!(bin.bytes.len(), 16);

        let gen = compiler
            .compile(&bson!({ "%binary": { "size": 4, "as": "hex" } }))
            .unwrap();
        let Bson::String(hex) = gen.generate(&mut ctx) else {
            panic!("expected a string");
        };
        assert_eq!(hex.len(), 8);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_uuid_shapes() {
        let Bson::String(s) = uuid_string() else {
            panic!("expected a string");
        };
        assert_eq!(s.len(), 36);
        let Bson::Binary(bin) = uuid_binary() else {
            panic!("expected binary");
        };
        assert_eq!(bin.subtype, BinarySubtype::Uuid);
        assert_eq!(bin.bytes.len(), 16);
    }
}
