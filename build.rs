fn main() {
    capnpc::CompilerCommand::new()
        .src_prefix("schema")
        .file("schema/telerepl.capnp")
        .default_parent_module(vec!["rpc".to_owned()])
        .run()
        .expect("compiled telerepl");
}
