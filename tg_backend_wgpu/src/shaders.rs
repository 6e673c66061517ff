//! WGSL compute shaders.
//!
//! Every shader reads its parameters from a `u32` storage array at binding 0,
//! runs 64 threads per workgroup and spreads workgroups over x and y so large
//! tensors stay under the per-dimension dispatch limit. Element values are
//! 32-bit words: f32 for float and bool tensors (bool as 0.0 / 1.0), i32 for
//! int tensors.

/// Threads per workgroup; must match `@workgroup_size` below.
pub const WORKGROUP_SIZE: u32 = 64;

/// Element-wise unary float ops. Params: `[len, op, alpha_bits]`.
pub const UNARY: &str = r#"
@group(0) @binding(0) var<storage, read> params: array<u32>;
@group(0) @binding(1) var<storage, read> x: array<f32>;
@group(0) @binding(2) var<storage, read_write> dst: array<f32>;

fn stable_tanh(v: f32) -> f32 {
    let t = exp(-2.0 * abs(v));
    return sign(v) * (1.0 - t) / (1.0 + t);
}

fn apply(op: u32, v: f32, alpha: f32) -> f32 {
    var r = v;
    switch op {
        case 0u: { r = -v; }
        case 1u: { r = abs(v); }
        case 2u: { r = exp(v); }
        case 3u: { r = log(v); }
        case 4u: { r = sqrt(v); }
        case 5u: { r = v * v; }
        case 6u: { r = sin(v); }
        case 7u: { r = cos(v); }
        case 8u: { r = stable_tanh(v); }
        case 9u: { r = 1.0 / (1.0 + exp(-v)); }
        case 10u: { r = max(v, 0.0); }
        case 11u: { r = select(exp(v) - 1.0, v, v > 0.0); }
        case 12u: { r = select(alpha * v, v, v > 0.0); }
        case 13u: { r = select(alpha, 1.0, v > 0.0); }
        default: {}
    }
    return r;
}

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) gid: vec3<u32>, @builtin(num_workgroups) nwg: vec3<u32>) {
    let i = gid.x + gid.y * nwg.x * 64u;
    if (i >= params[0]) {
        return;
    }
    dst[i] = apply(params[1], x[i], bitcast<f32>(params[2]));
}
"#;

/// Broadcasting binary float ops and comparisons.
/// Params: `[len, op, rank, out_shape.., a_strides.., b_strides..]`.
pub const BINARY: &str = r#"
@group(0) @binding(0) var<storage, read> params: array<u32>;
@group(0) @binding(1) var<storage, read> a: array<f32>;
@group(0) @binding(2) var<storage, read> b: array<f32>;
@group(0) @binding(3) var<storage, read_write> dst: array<f32>;

fn source_index(i: u32, rank: u32, strides_at: u32) -> u32 {
    var rem = i;
    var idx = 0u;
    for (var d = i32(rank) - 1; d >= 0; d = d - 1) {
        let dim = params[3u + u32(d)];
        idx = idx + (rem % dim) * params[strides_at + u32(d)];
        rem = rem / dim;
    }
    return idx;
}

// Negative bases only have real powers for integral exponents.
fn safe_pow(x: f32, y: f32) -> f32 {
    if (y == 0.0) {
        return 1.0;
    }
    if (x >= 0.0) {
        return pow(x, y);
    }
    if (fract(y) != 0.0) {
        return sqrt(x);
    }
    let r = pow(-x, y);
    return select(r, -r, fract(y * 0.5) != 0.0);
}

fn apply(op: u32, x: f32, y: f32) -> f32 {
    var r = 0.0;
    switch op {
        case 0u: { r = x + y; }
        case 1u: { r = x - y; }
        case 2u: { r = x * y; }
        case 3u: { r = x / y; }
        case 4u: { r = safe_pow(x, y); }
        case 5u: { r = max(x, y); }
        case 6u: { r = min(x, y); }
        case 7u: { r = select(0.0, 1.0, x > y); }
        case 8u: { r = select(0.0, 1.0, x >= y); }
        case 9u: { r = select(0.0, 1.0, x < y); }
        case 10u: { r = select(0.0, 1.0, x <= y); }
        case 11u: { r = select(0.0, 1.0, x == y); }
        default: {}
    }
    return r;
}

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) gid: vec3<u32>, @builtin(num_workgroups) nwg: vec3<u32>) {
    let i = gid.x + gid.y * nwg.x * 64u;
    if (i >= params[0]) {
        return;
    }
    let rank = params[2];
    let ia = source_index(i, rank, 3u + rank);
    let ib = source_index(i, rank, 3u + 2u * rank);
    dst[i] = apply(params[1], a[ia], b[ib]);
}
"#;

/// Gather through strides, for transposes and broadcasts of any dtype.
/// Params: `[len, rank, out_shape.., src_strides..]`.
pub const STRIDED_COPY: &str = r#"
@group(0) @binding(0) var<storage, read> params: array<u32>;
@group(0) @binding(1) var<storage, read> x: array<u32>;
@group(0) @binding(2) var<storage, read_write> dst: array<u32>;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) gid: vec3<u32>, @builtin(num_workgroups) nwg: vec3<u32>) {
    let i = gid.x + gid.y * nwg.x * 64u;
    if (i >= params[0]) {
        return;
    }
    let rank = params[1];
    var rem = i;
    var idx = 0u;
    for (var d = i32(rank) - 1; d >= 0; d = d - 1) {
        let dim = params[2u + u32(d)];
        idx = idx + (rem % dim) * params[2u + rank + u32(d)];
        rem = rem / dim;
    }
    dst[i] = x[idx];
}
"#;

/// Fold contiguous blocks of `inner` floats, one block per thread.
/// Params: `[outer, op, inner, init_bits]`.
pub const REDUCE: &str = r#"
@group(0) @binding(0) var<storage, read> params: array<u32>;
@group(0) @binding(1) var<storage, read> x: array<f32>;
@group(0) @binding(2) var<storage, read_write> dst: array<f32>;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) gid: vec3<u32>, @builtin(num_workgroups) nwg: vec3<u32>) {
    let i = gid.x + gid.y * nwg.x * 64u;
    if (i >= params[0]) {
        return;
    }
    let op = params[1];
    let inner = params[2];
    let base = i * inner;
    var acc = bitcast<f32>(params[3]);
    for (var j = 0u; j < inner; j = j + 1u) {
        let v = x[base + j];
        switch op {
            case 2u: { acc = max(acc, v); }
            case 3u: { acc = min(acc, v); }
            default: { acc = acc + v; }
        }
    }
    if (op == 1u) {
        acc = acc / f32(inner);
    }
    dst[i] = acc;
}
"#;

/// Batched matmul, one output element per thread. A batch stride of zero
/// reuses one matrix for every batch entry.
/// Params: `[len, m, k, n, a_batch_stride, b_batch_stride]`.
pub const MATMUL: &str = r#"
@group(0) @binding(0) var<storage, read> params: array<u32>;
@group(0) @binding(1) var<storage, read> a: array<f32>;
@group(0) @binding(2) var<storage, read> b: array<f32>;
@group(0) @binding(3) var<storage, read_write> dst: array<f32>;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) gid: vec3<u32>, @builtin(num_workgroups) nwg: vec3<u32>) {
    let i = gid.x + gid.y * nwg.x * 64u;
    if (i >= params[0]) {
        return;
    }
    let m = params[1];
    let k = params[2];
    let n = params[3];
    let batch = i / (m * n);
    let row = (i % (m * n)) / n;
    let col = i % n;
    let a_base = batch * params[4] + row * k;
    let b_base = batch * params[5] + col;
    var sum = 0.0;
    for (var l = 0u; l < k; l = l + 1u) {
        sum = sum + a[a_base + l] * b[b_base + l * n];
    }
    dst[i] = sum;
}
"#;
