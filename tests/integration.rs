mod common;

mod integration {
    pub mod dispatch;
    pub mod scheduler;
}
