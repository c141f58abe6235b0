pub mod background;
pub mod coincidence;
pub mod extract;
pub mod profile;
pub mod reduce;
pub mod secondorder;
pub mod track;
