/*
 * Copyright 2020 Google LLC
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *       http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
#[error("{field} has invalid value{clarification}{examples}",
    clarification = clarification
                    .as_ref()
                    .map(|v| format!(": {}", v))
                    .unwrap_or_default(),
    examples = examples
                    .as_ref()
                    .map(|v| format!(": {}", v.join(", ")))
                    .unwrap_or_default(),
    )]
pub struct ValueInvalidArgs {
    pub field: String,
    pub clarification: Option<String>,
    pub examples: Option<Vec<String>>,
}

/// Validation failure for a config file or a discovered resource.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("field {0} is not unique")]
    NotUnique(String),
    #[error("unsupported config version `{0}`")]
    UnsupportedVersion(String),
    #[error("identity `{identity}` is outside of trust domain `{trust_domain}`")]
    ForeignIdentity {
        identity: String,
        trust_domain: String,
    },
    #[error(transparent)]
    ValueInvalid(#[from] ValueInvalidArgs),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_invalid_message() {
        let error = ValueInvalidArgs {
            field: "routes.reviews.retry.attempts".into(),
            clarification: Some("must allow at least one attempt".into()),
            examples: Some(vec!["1".into(), "3".into()]),
        };

        assert_eq!(
            "routes.reviews.retry.attempts has invalid value: must allow at least one attempt: 1, 3",
            error.to_string()
        );
    }
}
