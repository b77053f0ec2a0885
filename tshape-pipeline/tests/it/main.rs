mod manager;
mod pipeline;
