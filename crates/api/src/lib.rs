//! Generated wire types and service stubs for the scene streaming protocol.

pub mod gen {
    pub mod scene {
        pub mod v1 {
            tonic::include_proto!("scene.v1");
        }
    }
}
