//! Plan-construction contract: JSON documents that describe one operator,
//! validated, constructed, then wired to already-built children by name.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use strand_common::{Result, StrandError};

use crate::merge_join::{MergeJoin, MergeJoinConfig};
use crate::operator::Operator;

/// One operator's encoding.
pub trait OperatorEncoding: DeserializeOwned {
    type Op: Operator + 'static;

    /// Fields that must be present for the encoding to be valid.
    fn required_arguments(&self) -> &'static [&'static str];

    /// Required fields that are absent from this document.
    fn missing_arguments(&self) -> Vec<&'static str>;

    fn validate(&self) -> Result<()> {
        let missing = self.missing_arguments();
        if missing.is_empty() {
            return Ok(());
        }
        Err(StrandError::InvalidConfig(format!(
            "missing required arguments: {}",
            missing.join(", ")
        )))
    }

    fn construct(&self) -> Result<Self::Op>;

    /// Wire children, taking them out of `operators` by name.
    fn connect(
        &self,
        op: &mut Self::Op,
        operators: &mut HashMap<String, Box<dyn Operator>>,
    ) -> Result<()>;

    /// Validate, construct and connect in one go.
    fn build(
        &self,
        operators: &mut HashMap<String, Box<dyn Operator>>,
    ) -> Result<Box<dyn Operator>> {
        self.validate()?;
        let mut op = self.construct()?;
        self.connect(&mut op, operators)?;
        Ok(Box::new(op))
    }
}

/// Parse an encoding document.
pub fn decode_encoding<E: OperatorEncoding>(json: &[u8]) -> Result<E> {
    serde_json::from_slice(json)
        .map_err(|e| StrandError::InvalidConfig(format!("invalid operator encoding: {e}")))
}

fn take_child(
    operators: &mut HashMap<String, Box<dyn Operator>>,
    name: &str,
) -> Result<Box<dyn Operator>> {
    operators
        .remove(name)
        .ok_or_else(|| StrandError::InvalidConfig(format!("unknown child operator '{name}'")))
}

/// Encoding of [`MergeJoin`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeJoinEncoding {
    pub arg_child1: Option<String>,
    pub arg_child2: Option<String>,
    pub arg_column_names: Option<Vec<String>>,
    pub arg_columns1: Option<Vec<usize>>,
    pub arg_columns2: Option<Vec<usize>>,
    pub arg_select1: Option<Vec<usize>>,
    pub arg_select2: Option<Vec<usize>>,
    pub acending: Option<Vec<bool>>,
}

impl MergeJoinEncoding {
    fn config(&self) -> Result<MergeJoinConfig> {
        fn field<T: Clone>(v: &Option<T>, name: &str) -> Result<T> {
            v.clone().ok_or_else(|| {
                StrandError::InvalidConfig(format!("missing required arguments: {name}"))
            })
        }
        Ok(MergeJoinConfig {
            left_keys: field(&self.arg_columns1, "argColumns1")?,
            right_keys: field(&self.arg_columns2, "argColumns2")?,
            left_select: field(&self.arg_select1, "argSelect1")?,
            right_select: field(&self.arg_select2, "argSelect2")?,
            output_names: self.arg_column_names.clone(),
            ascending: field(&self.acending, "acending")?,
        })
    }
}

impl OperatorEncoding for MergeJoinEncoding {
    type Op = MergeJoin;

    fn required_arguments(&self) -> &'static [&'static str] {
        &[
            "argChild1",
            "argChild2",
            "argColumns1",
            "argColumns2",
            "argSelect1",
            "argSelect2",
            "acending",
        ]
    }

    fn missing_arguments(&self) -> Vec<&'static str> {
        let present = [
            self.arg_child1.is_some(),
            self.arg_child2.is_some(),
            self.arg_columns1.is_some(),
            self.arg_columns2.is_some(),
            self.arg_select1.is_some(),
            self.arg_select2.is_some(),
            self.acending.is_some(),
        ];
        self.required_arguments()
            .iter()
            .zip(present)
            .filter(|(_, present)| !present)
            .map(|(name, _)| *name)
            .collect()
    }

    fn construct(&self) -> Result<MergeJoin> {
        MergeJoin::new(self.config()?)
    }

    fn connect(
        &self,
        op: &mut MergeJoin,
        operators: &mut HashMap<String, Box<dyn Operator>>,
    ) -> Result<()> {
        let left_name = self.arg_child1.as_deref().unwrap_or_default();
        let right_name = self.arg_child2.as_deref().unwrap_or_default();
        let left = take_child(operators, left_name)?;
        let right = take_child(operators, right_name)?;
        op.set_children(vec![left, right])
    }
}
