use crate::distributions::Prior;
use crate::nn::Activation;
use ndarray::Array2;
use std::collections::HashMap;

/// Index of a node in its [`Graph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub usize);

/// Tensor operations over `Array2` values.
///
/// Every node evaluates to a 2-D tensor. Scalars are `1×1`, vectors of length
/// `k` are `1×k`, and per-row quantities are `n×k`.
#[derive(Debug, Clone)]
pub enum Op {
    /// A slice `[offset, offset + rows*cols)` of the flat parameter vector,
    /// read in row-major order.
    Param {
        offset: usize,
        rows: usize,
        cols: usize,
    },
    /// A constant tensor (index into the constant table).
    Constant(usize),
    MatMul(NodeId, NodeId),
    /// `n×k` plus a `1×k` row broadcast over rows.
    AddBias(NodeId, NodeId),
    Activate(NodeId, Activation),
    Exp(NodeId),
    /// Sum of all elements, producing a scalar.
    Sum(NodeId),
    ConcatCols(NodeId, NodeId),
    /// `out[i, :] = table[idx[i], :]` (embedding lookup).
    GatherRows { table: NodeId, index: usize },
    /// `out[i, :] = input[i, t*width..(t+1)*width]` with `t = idx[i]`.
    TaskSlice {
        input: NodeId,
        index: usize,
        width: usize,
    },
    /// Per-row noise scale from a `1×T` vector: `out[i, 0] = scale[0, idx[i]]`.
    GatherScale { scale: NodeId, index: usize },
    /// Log-density of a prior evaluated element-wise and summed.
    PriorLogP { x: NodeId, prior: usize },
    /// Sum of Normal log-densities of observed data around `loc` with a
    /// broadcastable `scale` (`1×1`, `n×1` or `n×k`).
    NormalObsLogP {
        loc: NodeId,
        scale: NodeId,
        obs: usize,
    },
    /// Squared-exponential kernel with per-dimension lengthscales plus a
    /// diagonal noise term: `s·exp(-½Σ((zᵢ-zⱼ)/l)²) + (noise + jitter)·δᵢⱼ`.
    RbfKernel {
        z: NodeId,
        lengthscale: NodeId,
        scale: NodeId,
        noise: NodeId,
        jitter: f64,
    },
    /// Zero-mean multivariate Normal log-density of an observed column.
    MvnLogP { cov: NodeId, obs: usize },
}

/// One operation and its optional site name.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub op: Op,
    pub name: Option<String>,
}

/// The computational graph of one model log-density.
///
/// Nodes are stored in topological order (each node only references earlier
/// nodes). Constant tensors, observed data, index vectors and priors live in
/// side tables so that the node list stays small and the whole graph can be
/// shared read-only across sampler chains.
#[derive(Debug, Clone)]
pub struct Graph {
    pub nodes: Vec<Node>,
    pub param_count: usize,
    pub constants: Vec<Array2<f64>>,
    pub observed: Vec<Array2<f64>>,
    pub indices: Vec<Vec<usize>>,
    pub priors: Vec<Prior>,
    pub logp_terms: Vec<NodeId>,
    name_to_node: HashMap<String, NodeId>,
}

impl Graph {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            param_count: 0,
            constants: Vec::new(),
            observed: Vec::new(),
            indices: Vec::new(),
            priors: Vec::new(),
            logp_terms: Vec::new(),
            name_to_node: HashMap::new(),
        }
    }

    fn add_node(&mut self, op: Op, name: Option<String>) -> NodeId {
        let id = NodeId(self.nodes.len());
        if let Some(ref n) = name {
            self.name_to_node.insert(n.clone(), id);
        }
        self.nodes.push(Node { id, op, name });
        id
    }

    /// Reserve `rows*cols` entries of the parameter vector.
    pub fn add_param(&mut self, name: &str, rows: usize, cols: usize) -> NodeId {
        let offset = self.param_count;
        self.param_count += rows * cols;
        self.add_node(Op::Param { offset, rows, cols }, Some(name.to_string()))
    }

    pub fn add_constant(&mut self, value: Array2<f64>) -> NodeId {
        let idx = self.constants.len();
        self.constants.push(value);
        self.add_node(Op::Constant(idx), None)
    }

    pub fn add_scalar(&mut self, value: f64) -> NodeId {
        self.add_constant(Array2::from_elem((1, 1), value))
    }

    pub fn add_observed(&mut self, values: Array2<f64>) -> usize {
        let idx = self.observed.len();
        self.observed.push(values);
        idx
    }

    pub fn add_indices(&mut self, values: Vec<usize>) -> usize {
        let idx = self.indices.len();
        self.indices.push(values);
        idx
    }

    pub fn matmul(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.add_node(Op::MatMul(a, b), None)
    }

    pub fn add_bias(&mut self, a: NodeId, bias: NodeId) -> NodeId {
        self.add_node(Op::AddBias(a, bias), None)
    }

    pub fn activate(&mut self, a: NodeId, activation: Activation) -> NodeId {
        if activation == Activation::Identity {
            return a;
        }
        self.add_node(Op::Activate(a, activation), None)
    }

    pub fn exp(&mut self, a: NodeId) -> NodeId {
        self.add_node(Op::Exp(a), None)
    }

    pub fn sum(&mut self, a: NodeId) -> NodeId {
        self.add_node(Op::Sum(a), None)
    }

    pub fn concat_cols(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.add_node(Op::ConcatCols(a, b), None)
    }

    pub fn gather_rows(&mut self, table: NodeId, index: usize) -> NodeId {
        self.add_node(Op::GatherRows { table, index }, None)
    }

    pub fn task_slice(&mut self, input: NodeId, index: usize, width: usize) -> NodeId {
        self.add_node(Op::TaskSlice { input, index, width }, None)
    }

    pub fn gather_scale(&mut self, scale: NodeId, index: usize) -> NodeId {
        self.add_node(Op::GatherScale { scale, index }, None)
    }

    pub fn prior_logp(&mut self, x: NodeId, prior: Prior) -> NodeId {
        let idx = self.priors.len();
        self.priors.push(prior);
        let node = self.add_node(Op::PriorLogP { x, prior: idx }, None);
        self.logp_terms.push(node);
        node
    }

    pub fn normal_obs_logp(&mut self, loc: NodeId, scale: NodeId, obs: usize) -> NodeId {
        let node = self.add_node(Op::NormalObsLogP { loc, scale, obs }, None);
        self.logp_terms.push(node);
        node
    }

    pub fn rbf_kernel(
        &mut self,
        z: NodeId,
        lengthscale: NodeId,
        scale: NodeId,
        noise: NodeId,
        jitter: f64,
    ) -> NodeId {
        self.add_node(
            Op::RbfKernel {
                z,
                lengthscale,
                scale,
                noise,
                jitter,
            },
            None,
        )
    }

    pub fn mvn_logp(&mut self, cov: NodeId, obs: usize) -> NodeId {
        let node = self.add_node(Op::MvnLogP { cov, obs }, None);
        self.logp_terms.push(node);
        node
    }

    /// Add an arbitrary scalar node as an extra log-density term
    /// (Jacobian corrections of constrained parameters).
    pub fn add_logp_term(&mut self, node: NodeId) {
        self.logp_terms.push(node);
    }

    /// Register a derived quantity (e.g. `mu`, `sig`) under a name.
    pub fn set_name(&mut self, node: NodeId, name: &str) {
        self.nodes[node.0].name = Some(name.to_string());
        self.name_to_node.insert(name.to_string(), node);
    }

    pub fn node_by_name(&self, name: &str) -> Option<NodeId> {
        self.name_to_node.get(name).copied()
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}
