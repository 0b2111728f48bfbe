use std::collections::{HashMap, HashSet};

use smallvec::SmallVec;
use thiserror::Error;

use crate::ir::spec::{Computation, Instruction, Operand, ValueId, ValueType};

/// Stable identifier assigned to each instruction when indexing a computation body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct InstId(pub u32);

/// Captures structural indices for a single computation body.
///
/// Parameters are ordinary instructions, so every value has an instruction definition.
#[derive(Debug, Clone)]
pub struct ComputationIndices {
    inst_values: HashMap<InstId, ValueId>,
    value_types: HashMap<ValueId, ValueType>,
    pub pos_of: HashMap<InstId, usize>,
    pub value_to_inst: HashMap<ValueId, InstId>,
    pub users: HashMap<ValueId, SmallVec<[InstId; 4]>>,
    pub next_value: u32,
    pub next_inst: u32,
}

impl ComputationIndices {
    /// Builds indices for the provided computation and validates SSA invariants.
    pub fn build(computation: &Computation) -> Result<Self, ComputationIndexError> {
        let all_defs = computation
            .body
            .iter()
            .map(|inst| inst.id)
            .collect::<HashSet<_>>();
        let mut value_types: HashMap<ValueId, ValueType> = HashMap::new();
        let mut pos_of = HashMap::new();
        let mut value_to_inst = HashMap::new();
        let mut inst_values = HashMap::new();
        let mut users: HashMap<ValueId, SmallVec<[InstId; 4]>> = HashMap::new();

        for (index, instruction) in computation.body.iter().enumerate() {
            let inst_id = InstId(index as u32);

            for operand in &instruction.operands {
                let referenced = operand.value();
                if !value_types.contains_key(&referenced) {
                    if all_defs.contains(&referenced) {
                        return Err(ComputationIndexError::UseBeforeDefinition {
                            value: referenced,
                            user: instruction.id,
                        });
                    }
                    return Err(ComputationIndexError::MissingValueDefinition {
                        value: referenced,
                    });
                }
                push_unique(users.entry(referenced).or_default(), inst_id);
            }

            if value_types.contains_key(&instruction.id) {
                return Err(ComputationIndexError::DuplicateValue {
                    value: instruction.id,
                });
            }

            pos_of.insert(inst_id, index);
            value_to_inst.insert(instruction.id, inst_id);
            inst_values.insert(inst_id, instruction.id);
            value_types.insert(instruction.id, instruction.output.clone());
        }

        if !value_types.contains_key(&computation.root) {
            return Err(ComputationIndexError::MissingValueDefinition {
                value: computation.root,
            });
        }

        let max_value = computation.body.iter().map(|inst| inst.id.0).max();
        Ok(ComputationIndices {
            inst_values,
            value_types,
            pos_of,
            value_to_inst,
            users,
            next_value: max_value.map_or(0, |id| id + 1),
            next_inst: computation.body.len() as u32,
        })
    }

    /// Returns the instruction position for the provided identifier.
    pub fn position(&self, inst: InstId) -> Option<usize> {
        self.pos_of.get(&inst).copied()
    }

    /// Returns the SSA value defined by the provided instruction.
    pub fn value_of(&self, inst: InstId) -> Option<ValueId> {
        self.inst_values.get(&inst).copied()
    }

    /// Returns the instruction producing the given value.
    pub fn inst_of(&self, value: ValueId) -> Option<InstId> {
        self.value_to_inst.get(&value).copied()
    }

    /// Returns the schedule position of the instruction defining `value`.
    pub fn position_of_value(&self, value: ValueId) -> Option<usize> {
        self.inst_of(value).and_then(|inst| self.position(inst))
    }

    pub fn type_of(&self, value: ValueId) -> Option<&ValueType> {
        self.value_types.get(&value)
    }

    /// Returns the distinct users recorded for a given SSA value.
    pub fn users_of(&self, value: ValueId) -> &[InstId] {
        self.users
            .get(&value)
            .map(|list| list.as_slice())
            .unwrap_or(&[])
    }

    pub fn contains(&self, inst: InstId) -> bool {
        self.pos_of.contains_key(&inst)
    }

    pub(crate) fn allocate_inst(&mut self) -> InstId {
        let inst = InstId(self.next_inst);
        self.next_inst += 1;
        inst
    }

    pub(crate) fn insert_instruction(
        &mut self,
        inst_id: InstId,
        pos: usize,
        instruction: &Instruction,
    ) -> Result<(), ComputationIndexError> {
        if self.value_to_inst.contains_key(&instruction.id) {
            return Err(ComputationIndexError::DuplicateValue {
                value: instruction.id,
            });
        }
        for operand in &instruction.operands {
            let referenced = operand.value();
            match self.position_of_value(referenced) {
                None => {
                    return Err(ComputationIndexError::MissingValueDefinition {
                        value: referenced,
                    })
                }
                Some(def_pos) if def_pos >= pos => {
                    return Err(ComputationIndexError::UseBeforeDefinition {
                        value: referenced,
                        user: instruction.id,
                    })
                }
                Some(_) => {}
            }
        }

        self.shift_positions_from(pos, 1);
        self.pos_of.insert(inst_id, pos);
        self.value_to_inst.insert(instruction.id, inst_id);
        self.inst_values.insert(inst_id, instruction.id);
        self.value_types
            .insert(instruction.id, instruction.output.clone());
        self.add_operand_users(inst_id, &instruction.operands);
        self.next_value = self.next_value.max(instruction.id.0 + 1);
        Ok(())
    }

    pub(crate) fn remove_instruction(&mut self, inst: InstId, instruction: &Instruction) {
        if let Some(pos) = self.pos_of.remove(&inst) {
            self.shift_positions_from(pos + 1, -1);
        }
        if let Some(value) = self.inst_values.remove(&inst) {
            self.value_to_inst.remove(&value);
            self.value_types.remove(&value);
            self.users.remove(&value);
        }
        self.remove_operand_users(inst, &instruction.operands);
    }

    /// Re-derives the user lists of `inst` after its operands changed.
    pub(crate) fn refresh_operand_users(
        &mut self,
        inst: InstId,
        old_operands: &[Operand],
        new_operands: &[Operand],
    ) -> Result<(), ComputationIndexError> {
        for operand in new_operands {
            if !self.value_types.contains_key(&operand.value()) {
                return Err(ComputationIndexError::MissingValueDefinition {
                    value: operand.value(),
                });
            }
        }
        self.remove_operand_users(inst, old_operands);
        self.add_operand_users(inst, new_operands);
        Ok(())
    }

    fn shift_positions_from(&mut self, start: usize, delta: isize) {
        if delta == 0 {
            return;
        }
        for (_, pos) in self.pos_of.iter_mut() {
            if *pos >= start {
                if delta.is_positive() {
                    *pos += delta.unsigned_abs();
                } else {
                    *pos -= delta.unsigned_abs();
                }
            }
        }
    }

    fn add_operand_users(&mut self, inst: InstId, operands: &[Operand]) {
        for operand in operands {
            push_unique(self.users.entry(operand.value()).or_default(), inst);
        }
    }

    fn remove_operand_users(&mut self, inst: InstId, operands: &[Operand]) {
        for operand in operands {
            let referenced = operand.value();
            if let Some(list) = self.users.get_mut(&referenced) {
                list.retain(|id| *id != inst);
                if list.is_empty() {
                    self.users.remove(&referenced);
                }
            }
        }
    }
}

fn push_unique(list: &mut SmallVec<[InstId; 4]>, inst: InstId) {
    if !list.contains(&inst) {
        list.push(inst);
    }
}

/// Errors surfaced when building SSA indices for a computation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ComputationIndexError {
    #[error("duplicate value definition for %{value:?}")]
    DuplicateValue { value: ValueId },
    #[error("value %{value:?} is used but never defined")]
    MissingValueDefinition { value: ValueId },
    #[error("value %{value:?} is used by %{user:?} before its definition")]
    UseBeforeDefinition { value: ValueId, user: ValueId },
    #[error("instruction {inst:?} is not part of the computation")]
    UnknownInstruction { inst: InstId },
    #[error("value %{value:?} still has uses")]
    LiveUses { value: ValueId },
}
