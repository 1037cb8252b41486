//! User-facing model description

use std::collections::BTreeMap;

use gna_chip::{DataWidth, HwOperation};

/// Role of a tensor within an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operand {
    /// Input vectors
    Input,
    /// Output vectors
    Output,
    /// Weights or convolution filters
    Weights,
    /// Biases
    Biases,
    /// Piecewise-linear activation segments
    Activation,
    /// GMM means
    Means,
    /// GMM inverse covariances
    InverseCovariances,
    /// GMM Gaussian constants
    Constants,
}

/// Shape, element width and (optionally) location of a tensor.
///
/// Inputs and outputs may stay unbound and be supplied per request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tensor {
    /// Dimensions, outermost first
    pub shape: Vec<usize>,
    /// Element width
    pub width: DataWidth,
    /// Host address of the first element
    pub address: Option<usize>,
}

impl Tensor {
    /// Unbound tensor.
    #[must_use]
    pub fn new(shape: &[usize], width: DataWidth) -> Self {
        Self {
            shape: shape.to_vec(),
            width,
            address: None,
        }
    }

    /// Bind to a host address.
    #[must_use]
    pub const fn at(mut self, address: usize) -> Self {
        self.address = Some(address);
        self
    }

    /// Number of elements.
    #[must_use]
    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    /// Size in bytes.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.element_count() * self.width.bytes()
    }
}

/// How pooled convolution outputs are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolingKind {
    /// Largest value of the window
    Max,
    /// Sum of the window
    Sum,
}

impl PoolingKind {
    /// Two-bit descriptor code.
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::Max => 1,
            Self::Sum => 2,
        }
    }
}

/// Pooling window over convolution output positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pooling {
    /// Combination
    pub kind: PoolingKind,
    /// Window length
    pub size: usize,
    /// Window step
    pub stride: usize,
}

impl Pooling {
    /// Pooled positions for `positions` unpooled ones.
    #[must_use]
    pub const fn output_positions(&self, positions: usize) -> usize {
        if positions == 0 || self.stride == 0 {
            0
        } else {
            (positions - 1) / self.stride + 1
        }
    }
}

/// Scalar parameters of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Parameters {
    /// Convolution stride
    pub stride: usize,
    /// Convolution pooling
    pub pooling: Option<Pooling>,
    /// Recurrent feedback delay in vectors
    pub delay: usize,
    /// GMM score ceiling
    pub max_score: u32,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            stride: 1,
            pooling: None,
            delay: 1,
            max_score: u32::MAX,
        }
    }
}

/// One operation of a model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    /// Operation kind
    pub kind: HwOperation,
    /// Tensors by role
    pub operands: BTreeMap<Operand, Tensor>,
    /// Scalar parameters
    pub parameters: Parameters,
}

impl Operation {
    /// Operation without operands.
    #[must_use]
    pub fn new(kind: HwOperation) -> Self {
        Self {
            kind,
            operands: BTreeMap::new(),
            parameters: Parameters::default(),
        }
    }

    /// Set an operand.
    #[must_use]
    pub fn with(mut self, operand: Operand, tensor: Tensor) -> Self {
        self.operands.insert(operand, tensor);
        self
    }

    /// Set the parameters.
    #[must_use]
    pub const fn with_parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = parameters;
        self
    }

    /// Fully connected layer.
    #[must_use]
    pub fn affine(input: Tensor, output: Tensor, weights: Tensor, biases: Tensor) -> Self {
        Self::new(HwOperation::Affine)
            .with(Operand::Input, input)
            .with(Operand::Output, output)
            .with(Operand::Weights, weights)
            .with(Operand::Biases, biases)
    }

    /// Gaussian mixture scoring layer.
    #[must_use]
    pub fn gmm(
        input: Tensor,
        output: Tensor,
        means: Tensor,
        inverse_covariances: Tensor,
        constants: Tensor,
    ) -> Self {
        Self::new(HwOperation::Gmm)
            .with(Operand::Input, input)
            .with(Operand::Output, output)
            .with(Operand::Means, means)
            .with(Operand::InverseCovariances, inverse_covariances)
            .with(Operand::Constants, constants)
    }

    /// Tensor of a role.
    #[must_use]
    pub fn operand(&self, operand: Operand) -> Option<&Tensor> {
        self.operands.get(&operand)
    }
}

/// Ordered operations forming a model.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelDescription {
    /// Operations in execution order
    pub operations: Vec<Operation>,
}

impl ModelDescription {
    /// Model from operations.
    #[must_use]
    pub fn new(operations: Vec<Operation>) -> Self {
        Self { operations }
    }
}
