use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use thiserror::Error;

use crate::ir::ir_utils;
use crate::ir::spec::{
    CallKind, CallSpec, CollectiveKind, CollectiveSpec, Computation, ComputationBuilder, ComputationId, ConditionalSpec,
    CustomCallAttr, CustomCallSpec, DType, ElementwiseBinaryOp, ElementwiseUnaryOp, FusionKind,
    FusionSpec, GetTupleElementSpec, Module, Operand, Operation, ParameterSpec, TensorLiteral,
    ValueId, ValueType, WhileSpec,
};

/// Errors raised while parsing the module text format used in tests and fixtures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TextIrError {
    #[error("{0}")]
    Message(String),
}

impl TextIrError {
    fn new(msg: impl Into<String>) -> Self {
        TextIrError::Message(msg.into())
    }
}

/// Parses a module made of one or more computations.
///
/// Computations may reference each other in any order; the one marked `entry` becomes the
/// module entry, otherwise the last computation does.
///
/// # Example
/// ```
/// use cmdbuf_rs::ir::text_ir::parse_module;
///
/// let module = parse_module(r#"
/// module @demo
/// func @main(%x: tensor<f32, 4>, %y: tensor<f32, 4>) -> tensor<f32, 4> {
///   %sum = add(%x, %y) -> tensor<f32, 4>
///   return %sum
/// }
/// "#).expect("valid module");
/// assert_eq!(module.name, "demo");
/// assert_eq!(module.computations[0].body.len(), 3);
/// ```
pub fn parse_module(src: &str) -> Result<Module, TextIrError> {
    Parser::new(src).parse().map(|parsed| parsed.module)
}

/// Parses a module and keeps the textual value names of every computation.
pub fn parse_module_with_symbols(src: &str) -> Result<ParsedModule, TextIrError> {
    Parser::new(src).parse()
}

/// Module paired with the mapping from textual value names to SSA identifiers.
#[derive(Debug, Clone)]
pub struct ParsedModule {
    pub module: Module,
    /// Keyed by computation name, then by value name without the `%` sigil.
    pub value_names: HashMap<String, HashMap<String, ValueId>>,
}

impl ParsedModule {
    /// Looks up the value called `value` inside computation `computation`.
    pub fn value(&self, computation: &str, value: &str) -> Option<ValueId> {
        self.value_names
            .get(computation)?
            .get(value.trim_start_matches('%'))
            .copied()
    }
}

struct FunctionBlock<'a> {
    header: &'a str,
    is_entry: bool,
    lines: Vec<&'a str>,
}

struct Parser<'a> {
    source: &'a str,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Self {
        Self { source }
    }

    fn parse(&self) -> Result<ParsedModule, TextIrError> {
        if self.source.trim().is_empty() {
            return Err(TextIrError::new("input is empty"));
        }
        let (module_name, blocks) = self.split_blocks()?;
        if blocks.is_empty() {
            return Err(TextIrError::new("module must contain at least one `func`"));
        }

        let mut headers = Vec::with_capacity(blocks.len());
        let mut callees: HashMap<String, ComputationId> = HashMap::new();
        for (index, block) in blocks.iter().enumerate() {
            let header = parse_function_header(block.header)?;
            if callees
                .insert(header.name.clone(), ComputationId(index as u32))
                .is_some()
            {
                return Err(TextIrError::new(format!(
                    "duplicate computation `@{}`",
                    header.name
                )));
            }
            headers.push(header);
        }

        let entries = blocks.iter().filter(|block| block.is_entry).count();
        if entries > 1 {
            return Err(TextIrError::new("only one computation may be marked `entry`"));
        }

        let mut module = Module::new(module_name.unwrap_or_else(|| headers[0].name.clone()));
        let mut value_names = HashMap::new();
        for (index, (block, header)) in blocks.iter().zip(headers).enumerate() {
            let (computation, names) = self.parse_function(block, header, &callees)?;
            let name = computation.name.clone();
            let id = module.add_computation(computation);
            debug_assert_eq!(id, ComputationId(index as u32));
            value_names.insert(name, names);
        }
        module.entry = match blocks.iter().position(|block| block.is_entry) {
            Some(index) => ComputationId(index as u32),
            None => ComputationId(blocks.len() as u32 - 1),
        };

        Ok(ParsedModule {
            module,
            value_names,
        })
    }

    fn split_blocks(&self) -> Result<(Option<String>, Vec<FunctionBlock<'a>>), TextIrError> {
        let mut module_name = None;
        let mut blocks: Vec<FunctionBlock<'a>> = Vec::new();
        let mut current: Option<FunctionBlock<'a>> = None;

        for line in self.source.lines() {
            let statement = line.trim();
            if statement.is_empty() || statement.starts_with("//") {
                continue;
            }
            if let Some(block) = current.as_mut() {
                if statement == "}" {
                    if let Some(done) = current.take() {
                        blocks.push(done);
                    }
                } else {
                    block.lines.push(statement);
                }
                continue;
            }
            if let Some(name) = statement.strip_prefix("module") {
                if module_name.is_some() || !blocks.is_empty() {
                    return Err(TextIrError::new("`module` must be the first declaration"));
                }
                let name = name.trim().trim_start_matches('@').trim();
                if name.is_empty() {
                    return Err(TextIrError::new("module name cannot be empty"));
                }
                module_name = Some(name.to_string());
                continue;
            }
            let (is_entry, header) = match statement.strip_prefix("entry") {
                Some(rest) => (true, rest.trim_start()),
                None => (false, statement),
            };
            let header = header
                .strip_suffix('{')
                .ok_or_else(|| TextIrError::new("missing `{` to start function body"))?;
            current = Some(FunctionBlock {
                header,
                is_entry,
                lines: Vec::new(),
            });
        }

        if current.is_some() {
            return Err(TextIrError::new("missing `}` to end function body"));
        }
        Ok((module_name, blocks))
    }

    fn parse_function(
        &self,
        block: &FunctionBlock<'_>,
        header: FunctionHeader,
        callees: &HashMap<String, ComputationId>,
    ) -> Result<(Computation, HashMap<String, ValueId>), TextIrError> {
        let mut builder = ComputationBuilder::new();
        let mut value_map: HashMap<String, ValueId> = HashMap::new();

        for Parameter { name, ty } in header.params {
            let parsed_ty = parse_type(&ty)?;
            let id = builder.add_parameter(parsed_ty);
            if value_map.insert(name.clone(), id).is_some() {
                return Err(TextIrError::new(format!("duplicate value `%{name}`")));
            }
        }

        let mut root_name: Option<String> = None;
        for statement in &block.lines {
            if let Some(value) = statement.strip_prefix("return") {
                if root_name.is_some() {
                    return Err(TextIrError::new(
                        "multiple `return` statements are not allowed",
                    ));
                }
                let value = normalize_value_name(value.trim().trim_end_matches(';').trim());
                if value.is_empty() {
                    return Err(TextIrError::new("`return` must reference a value"));
                }
                root_name = Some(value);
                continue;
            }
            if root_name.is_some() {
                return Err(TextIrError::new("`return` must be the last statement"));
            }
            self.parse_statement(statement, &mut builder, &mut value_map, callees)?;
        }

        let root_name = root_name.ok_or_else(|| {
            TextIrError::new("function body must end with a `return` statement")
        })?;
        let root = value_map
            .get(&root_name)
            .copied()
            .ok_or_else(|| TextIrError::new(format!("unknown return value `{root_name}`")))?;

        let expected_result_ty = parse_type(&header.result_ty)?;
        if builder.value_type(root) != Some(&expected_result_ty) {
            return Err(TextIrError::new(format!(
                "declared result type of `@{}` does not match returned value type",
                header.name
            )));
        }

        let mut computation = builder.finish(header.name, root);
        if let Some(thread) = header.thread {
            computation.execution_thread = thread;
        }
        Ok((computation, value_map))
    }

    fn parse_statement(
        &self,
        statement: &str,
        builder: &mut ComputationBuilder,
        value_map: &mut HashMap<String, ValueId>,
        callees: &HashMap<String, ComputationId>,
    ) -> Result<(), TextIrError> {
        let (result_name_raw, rest) = statement
            .split_once('=')
            .ok_or_else(|| TextIrError::new("statements must be of the form `%result = ...`"))?;
        let result_name = normalize_value_name(result_name_raw.trim());
        if result_name.is_empty() {
            return Err(TextIrError::new("result identifier cannot be empty"));
        }
        if value_map.contains_key(&result_name) {
            return Err(TextIrError::new(format!("duplicate value `%{result_name}`")));
        }

        let (op_name, remainder) = parse_op_name(rest.trim())?;
        let (operand_specs, attributes, type_section) = split_operands_attrs_and_type(remainder)?;
        let result_type = parse_type(type_section)?;
        let operands = convert_operands(operand_specs, value_map)?;
        let operation = build_operation(&op_name, &operands, &result_type, &attributes, callees)?;

        let id = builder.emit(operation, operands, result_type);
        value_map.insert(result_name, id);
        Ok(())
    }
}

struct FunctionHeader {
    name: String,
    params: Vec<Parameter>,
    result_ty: String,
    thread: Option<String>,
}

struct Parameter {
    name: String,
    ty: String,
}

fn parse_function_header(header: &str) -> Result<FunctionHeader, TextIrError> {
    let header = header.trim();
    let header = header
        .strip_prefix("func")
        .ok_or_else(|| TextIrError::new("function header must start with `func`"))?
        .trim_start();
    let open_paren = header
        .find('(')
        .ok_or_else(|| TextIrError::new("missing `(` in function header"))?;
    let close_paren = find_matching(header, open_paren, '(', ')')
        .ok_or_else(|| TextIrError::new("missing `)` to close parameter list"))?;

    let name = header[..open_paren].trim().trim_start_matches('@').trim();
    if name.is_empty() {
        return Err(TextIrError::new("function name cannot be empty"));
    }
    let params = parse_parameters(&header[open_paren + 1..close_paren])?;

    let mut result_ty = header[close_paren + 1..]
        .trim()
        .strip_prefix("->")
        .ok_or_else(|| TextIrError::new("missing `->` and return type in header"))?
        .trim();
    let mut thread = None;
    if let Some(start) = result_ty.rfind("thread[") {
        let attr = &result_ty[start..];
        let value = attr
            .strip_prefix("thread[")
            .and_then(|rest| rest.strip_suffix(']'))
            .ok_or_else(|| TextIrError::new("malformed `thread[...]` attribute"))?
            .trim();
        if value.is_empty() {
            return Err(TextIrError::new("execution thread cannot be empty"));
        }
        thread = Some(value.to_string());
        result_ty = result_ty[..start].trim();
    }

    Ok(FunctionHeader {
        name: name.to_string(),
        params,
        result_ty: result_ty.to_string(),
        thread,
    })
}

fn parse_parameters(params: &str) -> Result<Vec<Parameter>, TextIrError> {
    let params = params.trim();
    if params.is_empty() {
        return Ok(Vec::new());
    }
    split_top_level(params, ',')
        .into_iter()
        .map(|raw| {
            let (name, ty) = raw
                .trim()
                .split_once(':')
                .ok_or_else(|| TextIrError::new("parameter must be `name: type`"))?;
            let name = normalize_value_name(name.trim());
            if name.is_empty() {
                return Err(TextIrError::new("parameter name cannot be empty"));
            }
            let ty = ty.trim();
            if ty.is_empty() {
                return Err(TextIrError::new("parameter type cannot be empty"));
            }
            Ok(Parameter {
                name,
                ty: ty.to_string(),
            })
        })
        .collect()
}

fn normalize_value_name(name: &str) -> String {
    name.trim_start_matches('%').to_string()
}

/// Parses a value type written as `tensor<dtype, dims>` or a parenthesised tuple.
pub fn parse_type(src: &str) -> Result<ValueType, TextIrError> {
    let trimmed = src.trim();
    if let Some(body) = trimmed.strip_prefix('(').and_then(|s| s.strip_suffix(')')) {
        let inner = body.trim();
        if inner.is_empty() {
            return Ok(ValueType::Tuple(Vec::new()));
        }
        let elements = split_top_level(inner, ',')
            .into_iter()
            .map(parse_type)
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(ValueType::Tuple(elements));
    }
    if let Some(body) = trimmed
        .strip_prefix("tensor<")
        .and_then(|s| s.strip_suffix('>'))
    {
        return parse_tensor_type(body);
    }
    Err(TextIrError::new(format!(
        "unsupported type `{trimmed}`; expected `tensor<...>` or a tuple"
    )))
}

fn parse_tensor_type(body: &str) -> Result<ValueType, TextIrError> {
    let mut parts = body.split(',');
    let dtype_str = parts
        .next()
        .ok_or_else(|| TextIrError::new("tensor type must specify a dtype"))?
        .trim();
    let dtype = parse_dtype(dtype_str)?;
    let dims_str = parts.next().unwrap_or("").trim();
    let dims = if dims_str.is_empty() {
        Vec::new()
    } else {
        parse_dimensions(dims_str)?
    };
    if parts.next().is_some() {
        return Err(TextIrError::new(
            "tensor type accepts only `tensor<dtype, dims>` form",
        ));
    }
    Ok(ir_utils::tensor_type(dtype, &dims))
}

fn parse_dtype(src: &str) -> Result<DType, TextIrError> {
    let normalized = src.trim().to_ascii_uppercase();
    match normalized.as_str() {
        "I1" => Ok(DType::I1),
        "SI8" => Ok(DType::Si8),
        "UI8" => Ok(DType::Ui8),
        "SI16" => Ok(DType::Si16),
        "UI16" => Ok(DType::Ui16),
        "SI32" => Ok(DType::Si32),
        "UI32" => Ok(DType::Ui32),
        "SI64" => Ok(DType::Si64),
        "UI64" => Ok(DType::Ui64),
        "BF16" => Ok(DType::Bf16),
        "F16" => Ok(DType::F16),
        "F32" => Ok(DType::F32),
        "F64" => Ok(DType::F64),
        other => Err(TextIrError::new(format!("unsupported dtype `{other}`"))),
    }
}

fn parse_dimensions(src: &str) -> Result<Vec<usize>, TextIrError> {
    src.split('x')
        .map(|dim| {
            let dim = dim.trim();
            if dim.is_empty() {
                return Err(TextIrError::new("dimension sizes cannot be empty"));
            }
            dim.parse::<usize>()
                .map_err(|_| TextIrError::new(format!("invalid dimension `{dim}`")))
        })
        .collect()
}

fn split_top_level(input: &str, delimiter: char) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (idx, ch) in input.char_indices() {
        match ch {
            '<' | '(' | '[' => depth += 1,
            '>' | ')' | ']' => {
                depth = depth.saturating_sub(1);
            }
            c if c == delimiter && depth == 0 => {
                if start != idx {
                    pieces.push(input[start..idx].trim());
                }
                start = idx + c.len_utf8();
            }
            _ => {}
        }
    }
    if start < input.len() {
        pieces.push(input[start..].trim());
    }
    pieces
}

fn parse_op_name(src: &str) -> Result<(String, &str), TextIrError> {
    let trimmed = src.trim_start();
    if trimmed.is_empty() {
        return Err(TextIrError::new("operation name is missing"));
    }
    let end = trimmed
        .char_indices()
        .find(|(_, ch)| ch.is_whitespace() || *ch == '(' || *ch == '%')
        .map_or(trimmed.len(), |(idx, _)| idx);
    let name = trimmed[..end].trim();
    if name.is_empty() {
        return Err(TextIrError::new("operation name cannot be empty"));
    }
    Ok((name.to_string(), trimmed[end..].trim_start()))
}

#[derive(Debug, Clone)]
struct AttributeExpr {
    name: String,
    value: String,
}

#[derive(Debug, Clone)]
enum OperandExpr {
    Value(String),
    TupleElement { tuple: String, index: usize },
}

fn split_operands_attrs_and_type(
    remainder: &str,
) -> Result<(Vec<OperandExpr>, Vec<AttributeExpr>, &str), TextIrError> {
    let (operands_section, ty_section) = remainder
        .split_once("->")
        .ok_or_else(|| TextIrError::new("operations must specify result type with `->`"))?;
    let (operand_tokens, attrs) = parse_operands_and_attributes(operands_section)?;
    let operand_exprs = operand_tokens
        .iter()
        .map(|token| parse_operand_expr(token))
        .collect::<Result<Vec<_>, _>>()?;
    Ok((operand_exprs, attrs, ty_section.trim()))
}

fn parse_operands_and_attributes(
    section: &str,
) -> Result<(Vec<String>, Vec<AttributeExpr>), TextIrError> {
    let mut operands = Vec::new();
    let mut attrs = Vec::new();
    let chars = section.trim();
    let bytes = chars.as_bytes();
    let len = bytes.len();
    let mut idx = 0usize;

    while idx < len {
        while idx < len && bytes[idx].is_ascii_whitespace() {
            idx += 1;
        }
        if idx >= len {
            break;
        }
        match bytes[idx] {
            b'(' => {
                let end = find_matching(chars, idx, '(', ')')
                    .ok_or_else(|| TextIrError::new("unmatched `(` in operand list"))?;
                for token in split_top_level(&chars[idx + 1..end], ',') {
                    if !token.is_empty() {
                        operands.push(token.to_string());
                    }
                }
                idx = end + 1;
            }
            b',' => {
                idx += 1;
            }
            _ => {
                let attr_start = idx;
                while idx < len && (bytes[idx].is_ascii_alphanumeric() || bytes[idx] == b'_') {
                    idx += 1;
                }
                if idx == attr_start || idx >= len || bytes[idx] != b'[' {
                    return Err(TextIrError::new(format!(
                        "unexpected token starting at `{}`",
                        &chars[attr_start..]
                    )));
                }
                let name = chars[attr_start..idx].to_string();
                let end = find_matching(chars, idx, '[', ']')
                    .ok_or_else(|| TextIrError::new("unmatched `[` in attribute"))?;
                let value = chars[idx + 1..end].trim().to_string();
                attrs.push(AttributeExpr { name, value });
                idx = end + 1;
            }
        }
    }

    Ok((operands, attrs))
}

fn find_matching(src: &str, start: usize, open: char, close: char) -> Option<usize> {
    let mut depth = 0isize;
    for (idx, byte) in src.as_bytes().iter().enumerate().skip(start) {
        if *byte == open as u8 {
            depth += 1;
        } else if *byte == close as u8 {
            depth -= 1;
            if depth == 0 {
                return Some(idx);
            }
        }
    }
    None
}

fn parse_operand_expr(src: &str) -> Result<OperandExpr, TextIrError> {
    let trimmed = src.trim();
    if !trimmed.starts_with('%') {
        return Err(TextIrError::new(format!(
            "operand `{trimmed}` must reference a value with `%`"
        )));
    }
    if let Some(open) = trimmed.find('[') {
        let index_str = trimmed[open + 1..]
            .strip_suffix(']')
            .ok_or_else(|| TextIrError::new(format!("malformed tuple operand `{trimmed}`")))?;
        let index = index_str
            .trim()
            .parse::<usize>()
            .map_err(|_| TextIrError::new(format!("invalid tuple index in `{trimmed}`")))?;
        return Ok(OperandExpr::TupleElement {
            tuple: normalize_value_name(&trimmed[..open]),
            index,
        });
    }
    Ok(OperandExpr::Value(normalize_value_name(trimmed)))
}

fn convert_operands(
    exprs: Vec<OperandExpr>,
    value_map: &HashMap<String, ValueId>,
) -> Result<Vec<Operand>, TextIrError> {
    let lookup = |name: &str| {
        value_map
            .get(name)
            .copied()
            .ok_or_else(|| TextIrError::new(format!("unknown value `%{name}`")))
    };
    exprs
        .into_iter()
        .map(|expr| match expr {
            OperandExpr::Value(name) => lookup(&name).map(Operand::Value),
            OperandExpr::TupleElement { tuple, index } => {
                lookup(&tuple).map(|tuple| Operand::TupleElement { tuple, index })
            }
        })
        .collect()
}

struct Attributes<'a> {
    op: &'a str,
    entries: &'a [AttributeExpr],
}

impl<'a> Attributes<'a> {
    fn get(&self, name: &str) -> Option<&'a str> {
        self.entries
            .iter()
            .find(|attr| attr.name == name)
            .map(|attr| attr.value.as_str())
    }

    fn require(&self, name: &str) -> Result<&'a str, TextIrError> {
        self.get(name).ok_or_else(|| {
            TextIrError::new(format!("`{}` requires attribute `{name}[...]`", self.op))
        })
    }

    fn require_usize(&self, name: &str) -> Result<usize, TextIrError> {
        let raw = self.require(name)?;
        raw.parse::<usize>().map_err(|_| {
            TextIrError::new(format!("`{}` attribute `{name}` must be an integer", self.op))
        })
    }

    fn only(&self, allowed: &[&str]) -> Result<(), TextIrError> {
        match self
            .entries
            .iter()
            .find(|attr| !allowed.contains(&attr.name.as_str()))
        {
            Some(attr) => Err(TextIrError::new(format!(
                "`{}` does not accept attribute `{}`",
                self.op, attr.name
            ))),
            None => Ok(()),
        }
    }
}

fn expect_arity(op: &str, operands: &[Operand], expected: usize) -> Result<(), TextIrError> {
    if operands.len() != expected {
        return Err(TextIrError::new(format!(
            "`{op}` expects {expected} operand(s), got {}",
            operands.len()
        )));
    }
    Ok(())
}

fn resolve_callee(
    raw: &str,
    callees: &HashMap<String, ComputationId>,
) -> Result<ComputationId, TextIrError> {
    let name = raw.trim().trim_start_matches('@');
    callees
        .get(name)
        .copied()
        .ok_or_else(|| TextIrError::new(format!("unknown computation `@{name}`")))
}

fn build_operation(
    op_name: &str,
    operands: &[Operand],
    result_type: &ValueType,
    attributes: &[AttributeExpr],
    callees: &HashMap<String, ComputationId>,
) -> Result<Operation, TextIrError> {
    let attrs = Attributes {
        op: op_name,
        entries: attributes,
    };
    if let Some(op) = unary_op(op_name) {
        attrs.only(&[])?;
        expect_arity(op_name, operands, 1)?;
        return Ok(Operation::ElementwiseUnary(op));
    }
    if let Some(op) = binary_op(op_name) {
        attrs.only(&[])?;
        expect_arity(op_name, operands, 2)?;
        return Ok(Operation::ElementwiseBinary(op));
    }
    if let Some(kind) = collective_kind(op_name) {
        attrs.only(&[])?;
        if operands.is_empty() {
            return Err(TextIrError::new(format!("`{op_name}` expects operands")));
        }
        return Ok(Operation::Collective(CollectiveSpec { kind }));
    }

    match op_name {
        "parameter" => {
            attrs.only(&["number"])?;
            expect_arity(op_name, operands, 0)?;
            Ok(Operation::Parameter(ParameterSpec {
                number: attrs.require_usize("number")?,
            }))
        }
        "constant" => {
            attrs.only(&["splat", "bytes"])?;
            expect_arity(op_name, operands, 0)?;
            Ok(Operation::Constant(parse_literal(&attrs, result_type)?))
        }
        "tuple" => {
            attrs.only(&[])?;
            if !matches!(result_type, ValueType::Tuple(elements) if elements.len() == operands.len())
            {
                return Err(TextIrError::new(
                    "`tuple` result type must be a tuple with one element per operand",
                ));
            }
            Ok(Operation::Tuple)
        }
        "get_tuple_element" => {
            attrs.only(&["index"])?;
            expect_arity(op_name, operands, 1)?;
            Ok(Operation::GetTupleElement(GetTupleElementSpec {
                index: attrs.require_usize("index")?,
            }))
        }
        "bitcast" => {
            attrs.only(&[])?;
            expect_arity(op_name, operands, 1)?;
            Ok(Operation::Bitcast)
        }
        "fusion" => {
            attrs.only(&["kind", "calls"])?;
            let kind = match attrs.get("kind").unwrap_or("loop") {
                "loop" => FusionKind::Loop,
                "input" => FusionKind::Input,
                "output" => FusionKind::Output,
                "custom" => FusionKind::Custom,
                other => return Err(TextIrError::new(format!("unknown fusion kind `{other}`"))),
            };
            Ok(Operation::Fusion(FusionSpec {
                kind,
                calls: resolve_callee(attrs.require("calls")?, callees)?,
            }))
        }
        "custom_call" => {
            let target = attrs.require("target")?.to_string();
            let mut extra = BTreeMap::new();
            for attr in attributes.iter().filter(|attr| attr.name != "target") {
                extra.insert(attr.name.clone(), parse_custom_call_attr(&attr.value));
            }
            Ok(Operation::CustomCall(CustomCallSpec {
                target,
                attrs: extra,
            }))
        }
        "conditional" => {
            attrs.only(&["branches"])?;
            let branches = split_top_level(attrs.require("branches")?, ',')
                .into_iter()
                .map(|name| resolve_callee(name, callees))
                .collect::<Result<Vec<_>, _>>()?;
            if branches.is_empty() {
                return Err(TextIrError::new("`conditional` needs at least one branch"));
            }
            if operands.len() != branches.len() + 1 {
                return Err(TextIrError::new(format!(
                    "`conditional` expects a selector plus one operand per branch, got {}",
                    operands.len()
                )));
            }
            Ok(Operation::Conditional(ConditionalSpec { branches }))
        }
        "while" => {
            attrs.only(&["condition", "body"])?;
            expect_arity(op_name, operands, 1)?;
            Ok(Operation::While(WhileSpec {
                condition: resolve_callee(attrs.require("condition")?, callees)?,
                body: resolve_callee(attrs.require("body")?, callees)?,
            }))
        }
        "call" => {
            attrs.only(&["to_apply", "kind"])?;
            let kind = match attrs.get("kind") {
                None | Some("regular") => CallKind::Regular,
                Some("command_buffer") => CallKind::CommandBuffer,
                Some(other) => return Err(TextIrError::new(format!("unknown call kind `{other}`"))),
            };
            Ok(Operation::Call(CallSpec {
                to_apply: resolve_callee(attrs.require("to_apply")?, callees)?,
                kind,
            }))
        }
        other => Err(TextIrError::new(format!("unsupported operation `{other}`"))),
    }
}

fn unary_op(name: &str) -> Option<ElementwiseUnaryOp> {
    Some(match name {
        "neg" => ElementwiseUnaryOp::Neg,
        "abs" => ElementwiseUnaryOp::Abs,
        "exp" => ElementwiseUnaryOp::Exp,
        "log" => ElementwiseUnaryOp::Log,
        "tanh" => ElementwiseUnaryOp::Tanh,
        "rsqrt" => ElementwiseUnaryOp::Rsqrt,
        _ => return None,
    })
}

fn binary_op(name: &str) -> Option<ElementwiseBinaryOp> {
    Some(match name {
        "add" => ElementwiseBinaryOp::Add,
        "sub" => ElementwiseBinaryOp::Sub,
        "mul" => ElementwiseBinaryOp::Mul,
        "div" => ElementwiseBinaryOp::Div,
        "max" => ElementwiseBinaryOp::Maximum,
        "min" => ElementwiseBinaryOp::Minimum,
        _ => return None,
    })
}

fn collective_kind(name: &str) -> Option<CollectiveKind> {
    Some(match name {
        "all_reduce" => CollectiveKind::AllReduce,
        "all_gather" => CollectiveKind::AllGather,
        "reduce_scatter" => CollectiveKind::ReduceScatter,
        "all_to_all" => CollectiveKind::AllToAll,
        "collective_permute" => CollectiveKind::CollectivePermute,
        _ => return None,
    })
}

fn parse_custom_call_attr(raw: &str) -> CustomCallAttr {
    match raw {
        "true" => CustomCallAttr::Bool(true),
        "false" => CustomCallAttr::Bool(false),
        other => match other.parse::<i64>() {
            Ok(value) => CustomCallAttr::I64(value),
            Err(_) => CustomCallAttr::String(other.to_string()),
        },
    }
}

fn parse_literal(attrs: &Attributes<'_>, result_type: &ValueType) -> Result<TensorLiteral, TextIrError> {
    let spec = match result_type {
        ValueType::Tensor(spec) => spec.clone(),
        ValueType::Tuple(_) => {
            return Err(TextIrError::new("`constant` must produce a tensor"));
        }
    };
    let byte_len = spec
        .byte_len()
        .ok_or_else(|| TextIrError::new("`constant` is too large"))?;

    let bytes = if let Some(raw) = attrs.get("splat") {
        if spec.dtype != DType::F32 {
            return Err(TextIrError::new("`splat[...]` constants must be f32"));
        }
        let value = raw
            .parse::<f32>()
            .map_err(|_| TextIrError::new(format!("invalid splat value `{raw}`")))?;
        let count = byte_len / DType::F32.size_in_bytes();
        value.to_le_bytes().repeat(count)
    } else if let Some(raw) = attrs.get("bytes") {
        let bytes = decode_hex(raw)?;
        if bytes.len() != byte_len {
            return Err(TextIrError::new(format!(
                "constant payload has {} bytes, type needs {byte_len}",
                bytes.len()
            )));
        }
        bytes
    } else {
        return Err(TextIrError::new("`constant` requires `splat[...]` or `bytes[...]`"));
    };

    Ok(TensorLiteral::new(spec, Arc::<[u8]>::from(bytes)))
}

fn decode_hex(raw: &str) -> Result<Vec<u8>, TextIrError> {
    if raw.len() % 2 != 0 {
        return Err(TextIrError::new("hex payload must have an even length"));
    }
    (0..raw.len())
        .step_by(2)
        .map(|idx| {
            raw.get(idx..idx + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| TextIrError::new(format!("invalid hex payload `{raw}`")))
        })
        .collect()
}

/// Parses a module from text, panicking with the parser message on failure.
#[macro_export]
macro_rules! hlo_module {
    ($src:expr) => {{
        $crate::ir::text_ir::parse_module($src).expect("failed to parse module text")
    }};
}
