use anyhow::Result;

use tensor_dag::{
    ops::{BinaryOp, ElementWise, MatMul, Transpose, Unary, UnaryOp},
    CpuProvider, DataType, Graph, GraphOptions,
};

fn main() -> Result<()> {
    let options = match std::env::args().nth(1) {
        Some(path) => GraphOptions::from_json(&std::fs::read_to_string(path)?)?,
        None => GraphOptions::default(),
    };
    let mut graph = Graph::with_options(CpuProvider::shared(), options);

    // y = relu(x @ transpose(w)) + b, with a redundant transpose pair on x
    let x = graph.add_tensor(vec![4, 32, 16], DataType::Float32);
    let w = graph.add_tensor(vec![64, 16], DataType::Float32);
    let b = graph.add_tensor(vec![64], DataType::Float32);

    let t1 = graph.add_op(Transpose::new(vec![0, 2, 1]), &[x])?;
    let xt = graph.operator(t1).unwrap().output();
    let t2 = graph.add_op(Transpose::new(vec![0, 2, 1]), &[xt])?;
    let x2 = graph.operator(t2).unwrap().output();
    let tw = graph.add_op(Transpose::new(vec![1, 0]), &[w])?;
    let wt = graph.operator(tw).unwrap().output();
    let mm = graph.add_op(MatMul::new(false, false), &[x2, wt])?;
    let h = graph.operator(mm).unwrap().output();
    let relu = graph.add_op(Unary::new(UnaryOp::Relu), &[h])?;
    let r = graph.operator(relu).unwrap().output();
    graph.add_op(ElementWise::new(BinaryOp::Add), &[r, b])?;

    println!("Before optimization:\n{}", graph);
    let stats = graph.optimize();
    println!("Optimization stats: {}", serde_json::to_string_pretty(&stats)?);

    graph.shape_infer()?;
    println!("After optimization:\n{}", graph);

    let plan = graph.data_malloc()?;
    println!("Memory plan:\n{}", plan.to_json()?);
    println!("{}", graph.to_dot());
    Ok(())
}
