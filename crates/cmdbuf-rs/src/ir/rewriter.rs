use crate::ir::{
    index::{ComputationIndexError, ComputationIndices, InstId},
    spec::{Computation, Instruction, Operand, Operation, ValueId, ValueType},
};

/// Mutable computation editor with stable instruction identifiers and SSA accounting.
pub struct ComputationRewriter<'a> {
    pub computation: &'a mut Computation,
    indices: ComputationIndices,
}

impl<'a> ComputationRewriter<'a> {
    /// Creates a rewriter for the provided computation, indexing its body.
    pub fn new(computation: &'a mut Computation) -> Result<Self, ComputationIndexError> {
        let indices = ComputationIndices::build(computation)?;
        Ok(Self {
            computation,
            indices,
        })
    }

    pub fn instruction(&self, inst: InstId) -> Option<&Instruction> {
        let pos = self.indices.position(inst)?;
        self.computation.body.get(pos)
    }

    /// Returns the operation referenced by `inst`.
    pub fn op(&self, inst: InstId) -> Option<&Operation> {
        self.instruction(inst).map(|instruction| &instruction.op)
    }

    /// Returns the operands for the given instruction.
    pub fn operands(&self, inst: InstId) -> &[Operand] {
        self.instruction(inst)
            .map(|instruction| instruction.operands.as_slice())
            .unwrap_or(&[])
    }

    /// Returns the SSA value produced by the instruction.
    pub fn value_of(&self, inst: InstId) -> Option<ValueId> {
        self.indices.value_of(inst)
    }

    pub fn type_of(&self, value: ValueId) -> Option<&ValueType> {
        self.indices.type_of(value)
    }

    /// Returns the instruction defining the provided value.
    pub fn inst_of(&self, value: ValueId) -> Option<InstId> {
        self.indices.inst_of(value)
    }

    pub fn position(&self, inst: InstId) -> Option<usize> {
        self.indices.position(inst)
    }

    /// Returns the recorded users for the value.
    pub fn users_of(&self, value: ValueId) -> &[InstId] {
        self.indices.users_of(value)
    }

    pub fn contains(&self, inst: InstId) -> bool {
        self.indices.contains(inst)
    }

    pub fn root(&self) -> ValueId {
        self.computation.root
    }

    pub fn set_root(&mut self, value: ValueId) -> Result<(), ComputationIndexError> {
        if self.indices.inst_of(value).is_none() {
            return Err(ComputationIndexError::MissingValueDefinition { value });
        }
        self.computation.root = value;
        Ok(())
    }

    /// Replaces all uses of `from` with `to`, including the root.
    pub fn replace_all_uses(&mut self, from: ValueId, to: ValueId) -> Result<(), ComputationIndexError> {
        if from == to {
            return Ok(());
        }
        let consumers = self.indices.users_of(from).to_vec();
        for inst in consumers {
            self.rewrite_operands(inst, |operand| {
                if operand.value() == from {
                    operand.with_value(to)
                } else {
                    operand
                }
            })?;
        }
        if self.computation.root == from {
            self.set_root(to)?;
        }
        Ok(())
    }

    /// Replaces uses of `from` with `to` in the listed users only. The root is left alone.
    pub fn replace_uses_in(
        &mut self,
        from: ValueId,
        to: ValueId,
        users: &[InstId],
    ) -> Result<(), ComputationIndexError> {
        for inst in users {
            self.rewrite_operands(*inst, |operand| {
                if operand.value() == from {
                    operand.with_value(to)
                } else {
                    operand
                }
            })?;
        }
        Ok(())
    }

    /// Rewrites the operands of `inst` in place through `f`, keeping user lists current.
    pub fn rewrite_operands(
        &mut self,
        inst: InstId,
        mut f: impl FnMut(Operand) -> Operand,
    ) -> Result<(), ComputationIndexError> {
        let pos = self
            .indices
            .position(inst)
            .ok_or(ComputationIndexError::UnknownInstruction { inst })?;
        let old_operands = self.computation.body[pos].operands.clone();
        let new_operands = old_operands.iter().map(|operand| f(*operand)).collect::<Vec<_>>();
        if new_operands == old_operands {
            return Ok(());
        }
        for operand in &new_operands {
            match self.indices.position_of_value(operand.value()) {
                None => {
                    return Err(ComputationIndexError::MissingValueDefinition {
                        value: operand.value(),
                    })
                }
                Some(def_pos) if def_pos >= pos => {
                    return Err(ComputationIndexError::UseBeforeDefinition {
                        value: operand.value(),
                        user: self.computation.body[pos].id,
                    })
                }
                Some(_) => {}
            }
        }
        self.indices
            .refresh_operand_users(inst, &old_operands, &new_operands)?;
        self.computation.body[pos].operands = new_operands;
        Ok(())
    }

    /// Erases the instruction identified by `inst`; it must have no users and not be the root.
    pub fn erase_inst(&mut self, inst: InstId) -> Result<(), ComputationIndexError> {
        let value = self
            .indices
            .value_of(inst)
            .ok_or(ComputationIndexError::UnknownInstruction { inst })?;
        if !self.indices.users_of(value).is_empty() || self.computation.root == value {
            return Err(ComputationIndexError::LiveUses { value });
        }
        let pos = self
            .indices
            .position(inst)
            .ok_or(ComputationIndexError::UnknownInstruction { inst })?;
        let instruction = self.computation.body.remove(pos);
        self.indices.remove_instruction(inst, &instruction);
        Ok(())
    }

    /// Inserts a new instruction before `at`, returning its identifiers.
    pub fn insert_before(
        &mut self,
        at: InstId,
        op: Operation,
        operands: Vec<Operand>,
        output: ValueType,
    ) -> Result<(InstId, ValueId), ComputationIndexError> {
        let pos = self
            .indices
            .position(at)
            .ok_or(ComputationIndexError::UnknownInstruction { inst: at })?;
        self.insert_at_pos(pos, op, operands, output)
    }

    /// Inserts a new instruction right after `at`, returning its identifiers.
    pub fn insert_after(
        &mut self,
        at: InstId,
        op: Operation,
        operands: Vec<Operand>,
        output: ValueType,
    ) -> Result<(InstId, ValueId), ComputationIndexError> {
        let pos = self
            .indices
            .position(at)
            .ok_or(ComputationIndexError::UnknownInstruction { inst: at })?;
        self.insert_at_pos(pos + 1, op, operands, output)
    }

    /// Verifies basic SSA invariants after mutations.
    pub fn verify(&self) -> bool {
        ComputationIndices::build(self.computation).is_ok()
    }

    fn insert_at_pos(
        &mut self,
        pos: usize,
        op: Operation,
        operands: Vec<Operand>,
        output: ValueType,
    ) -> Result<(InstId, ValueId), ComputationIndexError> {
        let value_id = ValueId(self.indices.next_value);
        let instruction = Instruction {
            id: value_id,
            op,
            operands,
            output,
        };
        let inst_id = self.indices.allocate_inst();
        self.indices.insert_instruction(inst_id, pos, &instruction)?;
        self.computation.body.insert(pos, instruction);
        Ok((inst_id, value_id))
    }
}
