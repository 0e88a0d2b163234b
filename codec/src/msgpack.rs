use heron_rpc_core::Codec;
use serde::{Deserialize, Serialize};

/// MessagePack rendition of the [`Codec`] contract, via rmp-serde.
///
/// Field names are kept on the wire (`to_vec_named`) so that both endpoints
/// can evolve their envelope structs independently of field order.
#[derive(Default)]
pub struct MsgpCodec();

impl Codec for MsgpCodec {
    #[inline(always)]
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, ()> {
        match rmp_serde::encode::to_vec_named(msg) {
            Ok(buf) => return Ok(buf),
            Err(e) => {
                log::error!("encode error: {:?}", e);
                return Err(());
            }
        }
    }

    fn encode_into<T: Serialize>(&self, msg: &T, buf: &mut Vec<u8>) -> Result<usize, ()> {
        let pre_len = buf.len();
        if let Err(e) = rmp_serde::encode::write_named(buf, msg) {
            log::error!("encode error: {:?}", e);
            return Err(());
        } else {
            Ok(buf.len() - pre_len)
        }
    }

    #[inline(always)]
    fn decode<'a, T: Deserialize<'a>>(&self, buf: &'a [u8]) -> Result<T, ()> {
        match rmp_serde::decode::from_slice::<T>(buf) {
            Err(e) => {
                log::warn!("decode error: {:?}", e);
                return Err(());
            }
            Ok(s) => return Ok(s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msgp() {
        let codec = MsgpCodec::default();
        let encoded = codec.encode(&()).expect("encode");
        println!("encoded () size :{}", encoded.len());
        let _decoded: () = codec.decode(&encoded).expect("decode");
    }

    #[test]
    fn test_msgp_into() {
        let codec = MsgpCodec::default();
        let mut buf = Vec::new();
        let n = codec.encode_into(&(1u32, "two"), &mut buf).expect("encode");
        assert_eq!(n, buf.len());
        let decoded: (u32, String) = codec.decode(&buf).expect("decode");
        assert_eq!(decoded, (1, "two".to_string()));
    }
}
