mod flood;
mod maintenance;
mod routing;
mod stats;
