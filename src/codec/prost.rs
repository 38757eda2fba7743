/*
 * Copyright 2021 Google LLC
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Extensions to `prost` and related crates.

use prost_types::Any;

pub fn encode<M: prost::Message>(message: &M) -> Result<Vec<u8>, prost::EncodeError> {
    let mut buf = Vec::with_capacity(message.encoded_len());
    message.encode(&mut buf)?;
    Ok(buf)
}

/// Wraps `message` in an [`Any`] tagged with `type_url`.
pub fn encode_any<M: prost::Message>(
    type_url: &str,
    message: &M,
) -> Result<Any, prost::EncodeError> {
    Ok(Any {
        type_url: type_url.into(),
        value: encode(message)?,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum AnyError {
    #[error("expected resource of type `{expected}`, found `{found}`")]
    UnexpectedType { expected: String, found: String },
    #[error(transparent)]
    Decode(#[from] prost::DecodeError),
}

/// Unwraps an [`Any`], checking it carries `type_url`.
pub fn decode_any<M: prost::Message + Default>(type_url: &str, any: &Any) -> Result<M, AnyError> {
    if any.type_url != type_url {
        return Err(AnyError::UnexpectedType {
            expected: type_url.into(),
            found: any.type_url.clone(),
        });
    }

    Ok(M::decode(&*any.value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generated::trellis::mesh::v1 as proto;

    #[test]
    fn any_type_mismatch_is_rejected() {
        let service = proto::Service {
            name: "payments".into(),
            endpoints: Vec::new(),
        };
        let any = encode_any("type.googleapis.com/trellis.mesh.v1.Service", &service).unwrap();

        let decoded: proto::Service =
            decode_any("type.googleapis.com/trellis.mesh.v1.Service", &any).unwrap();
        assert_eq!(service, decoded);

        let error =
            decode_any::<proto::Route>("type.googleapis.com/trellis.mesh.v1.Route", &any)
                .unwrap_err();
        assert!(matches!(error, AnyError::UnexpectedType { .. }));
    }
}
